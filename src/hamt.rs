use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::slice;
use std::sync::Arc;

const BITS_PER_LEVEL: u32 = 5;
const LEVEL_MASK: u64 = (1 << BITS_PER_LEVEL) - 1;
const HASH_BITS: u32 = 64;

/// The hasher used by [`PersistentMap`] unless another one is requested.
///
/// It is deterministic for the lifetime of the process, which keeps the
/// trie shape a pure function of the inserted keys.
pub type DefaultHashBuilder = BuildHasherDefault<DefaultHasher>;

enum Entry<K, V> {
    Leaf { hash: u64, key: K, value: V },
    Branch(Arc<Node<K, V>>),
}

impl<K: Clone, V: Clone> Clone for Entry<K, V> {
    fn clone(&self) -> Entry<K, V> {
        match *self {
            Entry::Leaf {
                hash,
                ref key,
                ref value,
            } => Entry::Leaf {
                hash,
                key: key.clone(),
                value: value.clone(),
            },
            Entry::Branch(ref node) => Entry::Branch(node.clone()),
        }
    }
}

enum Node<K, V> {
    /// Up to 32 children addressed by one 5 bit group of the hash.
    Bitmap { bitmap: u32, entries: Vec<Entry<K, V>> },
    /// Keys whose full 64 bit hashes are equal.
    Collision { hash: u64, leaves: Vec<(K, V)> },
}

enum Removal<K, V> {
    Missing,
    /// The key was removed.  `None` means the node is now empty, otherwise
    /// this is what the parent should store in place of the old node.
    Removed(Option<Entry<K, V>>),
}

fn index(hash: u64, shift: u32) -> u32 {
    debug_assert!(shift < HASH_BITS);
    ((hash >> shift) & LEVEL_MASK) as u32
}

fn slot(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

impl<K, V> Node<K, V> {
    fn empty() -> Node<K, V> {
        Node::Bitmap {
            bitmap: 0,
            entries: Vec::new(),
        }
    }

    fn lookup<'a, Q>(mut node: &'a Node<K, V>, hash: u64, key: &Q) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut shift = 0;
        loop {
            match *node {
                Node::Bitmap {
                    bitmap,
                    ref entries,
                } => {
                    let bit = 1u32 << index(hash, shift);
                    if bitmap & bit == 0 {
                        return None;
                    }
                    match entries[slot(bitmap, bit)] {
                        Entry::Leaf {
                            hash: leaf_hash,
                            key: ref leaf_key,
                            ref value,
                        } => {
                            return if leaf_hash == hash && leaf_key.borrow() == key {
                                Some(value)
                            } else {
                                None
                            };
                        }
                        Entry::Branch(ref child) => {
                            node = child;
                            shift += BITS_PER_LEVEL;
                        }
                    }
                }
                Node::Collision {
                    hash: node_hash,
                    ref leaves,
                } => {
                    if node_hash != hash {
                        return None;
                    }
                    return leaves
                        .iter()
                        .find(|&&(ref k, _)| k.borrow() == key)
                        .map(|&(_, ref v)| v);
                }
            }
        }
    }
}

impl<K: Eq + Clone, V: Clone> Node<K, V> {
    /// Returns the new node and whether a key was added (as opposed to
    /// replaced).  Only nodes on the path to the key are reallocated.
    fn insert(
        this: &Arc<Node<K, V>>,
        shift: u32,
        hash: u64,
        key: K,
        value: V,
    ) -> (Arc<Node<K, V>>, bool) {
        match **this {
            Node::Bitmap {
                bitmap,
                ref entries,
            } => {
                let bit = 1u32 << index(hash, shift);
                let pos = slot(bitmap, bit);
                if bitmap & bit == 0 {
                    let mut entries = entries.clone();
                    entries.insert(pos, Entry::Leaf { hash, key, value });
                    let node = Node::Bitmap {
                        bitmap: bitmap | bit,
                        entries,
                    };
                    return (Arc::new(node), true);
                }

                let (replacement, added) = match entries[pos] {
                    Entry::Leaf {
                        hash: leaf_hash,
                        key: ref leaf_key,
                        value: ref leaf_value,
                    } => {
                        if leaf_hash == hash && *leaf_key == key {
                            (Entry::Leaf { hash, key, value }, false)
                        } else {
                            let existing = Entry::Leaf {
                                hash: leaf_hash,
                                key: leaf_key.clone(),
                                value: leaf_value.clone(),
                            };
                            let child = Node::pair(
                                shift + BITS_PER_LEVEL,
                                existing,
                                leaf_hash,
                                hash,
                                key,
                                value,
                            );
                            (Entry::Branch(child), true)
                        }
                    }
                    Entry::Branch(ref child) => {
                        let (child, added) =
                            Node::insert(child, shift + BITS_PER_LEVEL, hash, key, value);
                        (Entry::Branch(child), added)
                    }
                };

                let mut entries = entries.clone();
                entries[pos] = replacement;
                (Arc::new(Node::Bitmap { bitmap, entries }), added)
            }
            Node::Collision {
                hash: node_hash,
                ref leaves,
            } => {
                if node_hash != hash {
                    let existing = Entry::Branch(this.clone());
                    return (Node::pair(shift, existing, node_hash, hash, key, value), true);
                }
                let mut leaves = leaves.clone();
                let added = match leaves.iter().position(|&(ref k, _)| *k == key) {
                    Some(pos) => {
                        leaves[pos].1 = value;
                        false
                    }
                    None => {
                        leaves.push((key, value));
                        true
                    }
                };
                (Arc::new(Node::Collision { hash, leaves }), added)
            }
        }
    }

    /// Builds the smallest subtree at `shift` holding `existing` and a new leaf.
    fn pair(
        shift: u32,
        existing: Entry<K, V>,
        existing_hash: u64,
        hash: u64,
        key: K,
        value: V,
    ) -> Arc<Node<K, V>> {
        if existing_hash == hash {
            return match existing {
                Entry::Leaf {
                    key: leaf_key,
                    value: leaf_value,
                    ..
                } => Arc::new(Node::Collision {
                    hash,
                    leaves: vec![(leaf_key, leaf_value), (key, value)],
                }),
                Entry::Branch(node) => Node::insert(&node, shift, hash, key, value).0,
            };
        }

        let existing_idx = index(existing_hash, shift);
        let idx = index(hash, shift);
        let node = if existing_idx == idx {
            let child = Node::pair(
                shift + BITS_PER_LEVEL,
                existing,
                existing_hash,
                hash,
                key,
                value,
            );
            Node::Bitmap {
                bitmap: 1 << idx,
                entries: vec![Entry::Branch(child)],
            }
        } else {
            let leaf = Entry::Leaf { hash, key, value };
            let entries = if existing_idx < idx {
                vec![existing, leaf]
            } else {
                vec![leaf, existing]
            };
            Node::Bitmap {
                bitmap: (1 << existing_idx) | (1 << idx),
                entries,
            }
        };
        Arc::new(node)
    }

    fn remove<Q>(this: &Arc<Node<K, V>>, shift: u32, hash: u64, key: &Q) -> Removal<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match **this {
            Node::Bitmap {
                bitmap,
                ref entries,
            } => {
                let bit = 1u32 << index(hash, shift);
                if bitmap & bit == 0 {
                    return Removal::Missing;
                }
                let pos = slot(bitmap, bit);
                let replacement = match entries[pos] {
                    Entry::Leaf {
                        hash: leaf_hash,
                        key: ref leaf_key,
                        ..
                    } => {
                        if leaf_hash != hash || leaf_key.borrow() != key {
                            return Removal::Missing;
                        }
                        None
                    }
                    Entry::Branch(ref child) => {
                        match Node::remove(child, shift + BITS_PER_LEVEL, hash, key) {
                            Removal::Missing => return Removal::Missing,
                            Removal::Removed(replacement) => replacement,
                        }
                    }
                };

                let mut entries = entries.clone();
                let bitmap = match replacement {
                    Some(entry) => {
                        entries[pos] = entry;
                        bitmap
                    }
                    None => {
                        entries.remove(pos);
                        bitmap & !bit
                    }
                };
                Removal::Removed(Node::collapse(bitmap, entries))
            }
            Node::Collision {
                hash: node_hash,
                ref leaves,
            } => {
                if node_hash != hash {
                    return Removal::Missing;
                }
                let pos = match leaves.iter().position(|&(ref k, _)| k.borrow() == key) {
                    Some(pos) => pos,
                    None => return Removal::Missing,
                };
                let mut leaves = leaves.clone();
                leaves.remove(pos);
                if leaves.len() > 1 {
                    let node = Node::Collision { hash, leaves };
                    return Removal::Removed(Some(Entry::Branch(Arc::new(node))));
                }
                Removal::Removed(leaves.pop().map(|(key, value)| Entry::Leaf { hash, key, value }))
            }
        }
    }

    /// Keeps the trie canonical: a node left holding a single leaf (or a
    /// single collision node, which is position independent) is lifted into
    /// its parent.
    fn collapse(bitmap: u32, mut entries: Vec<Entry<K, V>>) -> Option<Entry<K, V>> {
        if entries.is_empty() {
            return None;
        }
        if entries.len() == 1 {
            let liftable = match entries[0] {
                Entry::Leaf { .. } => true,
                Entry::Branch(ref node) => match **node {
                    Node::Collision { .. } => true,
                    Node::Bitmap { .. } => false,
                },
            };
            if liftable {
                return entries.pop();
            }
        }
        Some(Entry::Branch(Arc::new(Node::Bitmap { bitmap, entries })))
    }
}

/// An immutable hash array mapped trie.
///
/// Every modification returns a new map and leaves the original untouched.
/// Unchanged subtrees are shared between the two by reference, so deriving
/// a map that differs in one key allocates only the nodes on the path from
/// the root to that key and cloning a map is a single reference count bump.
///
/// Maps can be freely shared across threads as long as keys and values can.
pub struct PersistentMap<K, V, S = DefaultHashBuilder> {
    root: Arc<Node<K, V>>,
    len: usize,
    hasher: S,
}

impl<K, V, S: Clone> Clone for PersistentMap<K, V, S> {
    fn clone(&self) -> PersistentMap<K, V, S> {
        PersistentMap {
            root: self.root.clone(),
            len: self.len,
            hasher: self.hasher.clone(),
        }
    }
}

impl<K, V, S: Default> Default for PersistentMap<K, V, S> {
    fn default() -> PersistentMap<K, V, S> {
        PersistentMap::with_hasher(S::default())
    }
}

impl<K, V> PersistentMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> PersistentMap<K, V> {
        PersistentMap::default()
    }
}

impl<K, V, S> PersistentMap<K, V, S> {
    /// Creates an empty map that hashes keys with `hasher`.
    pub fn with_hasher(hasher: S) -> PersistentMap<K, V, S> {
        PersistentMap {
            root: Arc::new(Node::empty()),
            len: 0,
            hasher,
        }
    }

    /// Number of keys in the map.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if both maps are the very same trie.
    ///
    /// This is an identity check; two maps built independently with equal
    /// contents compare unequal here.
    pub fn ptr_eq(&self, other: &PersistentMap<K, V, S>) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Iterates over all entries in unspecified order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            stack: vec![Cursor::of(&self.root)],
            remaining: self.len,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }
}

impl<K, V, S> PersistentMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn hash_of<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Looks up a key.  Absence is reported as `None`; this never fails and
    /// never allocates.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Node::lookup(&self.root, self.hash_of(key), key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Derives a map with `key` bound to `value`.
    pub fn insert(&self, key: K, value: V) -> PersistentMap<K, V, S> {
        let hash = self.hash_of(&key);
        let (root, added) = Node::insert(&self.root, 0, hash, key, value);
        PersistentMap {
            root,
            len: if added { self.len + 1 } else { self.len },
            hasher: self.hasher.clone(),
        }
    }

    /// Derives a map without `key`.  If the key is absent the returned map
    /// shares its root with `self`.
    pub fn remove<Q>(&self, key: &Q) -> PersistentMap<K, V, S>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let root = match Node::remove(&self.root, 0, self.hash_of(key), key) {
            Removal::Missing => return self.clone(),
            Removal::Removed(None) => Arc::new(Node::empty()),
            Removal::Removed(Some(Entry::Branch(node))) => node,
            Removal::Removed(Some(Entry::Leaf { hash, key, value })) => Arc::new(Node::Bitmap {
                bitmap: 1 << index(hash, 0),
                entries: vec![Entry::Leaf { hash, key, value }],
            }),
        };
        PersistentMap {
            root,
            len: self.len - 1,
            hasher: self.hasher.clone(),
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for PersistentMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> PersistentMap<K, V, S> {
        iter.into_iter()
            .fold(PersistentMap::default(), |map, (k, v)| map.insert(k, v))
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for PersistentMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

enum Cursor<'a, K, V> {
    Entries(slice::Iter<'a, Entry<K, V>>),
    Leaves(slice::Iter<'a, (K, V)>),
}

impl<'a, K, V> Cursor<'a, K, V> {
    fn of(node: &'a Node<K, V>) -> Cursor<'a, K, V> {
        match *node {
            Node::Bitmap { ref entries, .. } => Cursor::Entries(entries.iter()),
            Node::Collision { ref leaves, .. } => Cursor::Leaves(leaves.iter()),
        }
    }
}

/// Iterator over the entries of a [`PersistentMap`].
pub struct Iter<'a, K, V> {
    stack: Vec<Cursor<'a, K, V>>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<(&'a K, &'a V)> {
        loop {
            let descend = match *self.stack.last_mut()? {
                Cursor::Entries(ref mut it) => match it.next() {
                    Some(&Entry::Leaf {
                        ref key, ref value, ..
                    }) => {
                        self.remaining -= 1;
                        return Some((key, value));
                    }
                    Some(&Entry::Branch(ref node)) => Some(&**node),
                    None => None,
                },
                Cursor::Leaves(ref mut it) => match it.next() {
                    Some(&(ref key, ref value)) => {
                        self.remaining -= 1;
                        return Some((key, value));
                    }
                    None => None,
                },
            };
            match descend {
                Some(node) => self.stack.push(Cursor::of(node)),
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V, S> IntoIterator for &'a PersistentMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;

    /// Squeezes every key into one of four hashes.
    #[derive(Default)]
    struct CollidingHasher(u64);

    impl Hasher for CollidingHasher {
        fn finish(&self) -> u64 {
            self.0 % 4
        }

        fn write(&mut self, bytes: &[u8]) {
            for b in bytes {
                self.0 = self.0.wrapping_mul(31).wrapping_add(u64::from(*b));
            }
        }
    }

    type Colliding = BuildHasherDefault<CollidingHasher>;

    fn depth<K, V>(node: &Node<K, V>) -> usize {
        match *node {
            Node::Bitmap { ref entries, .. } => {
                1 + entries
                    .iter()
                    .map(|e| match *e {
                        Entry::Leaf { .. } => 0,
                        Entry::Branch(ref child) => depth(child),
                    })
                    .max()
                    .unwrap_or(0)
            }
            Node::Collision { .. } => 1,
        }
    }

    fn count_nodes<K, V>(node: &Node<K, V>) -> usize {
        match *node {
            Node::Bitmap { ref entries, .. } => {
                1 + entries
                    .iter()
                    .map(|e| match *e {
                        Entry::Leaf { .. } => 0,
                        Entry::Branch(ref child) => count_nodes(child),
                    })
                    .sum::<usize>()
            }
            Node::Collision { .. } => 1,
        }
    }

    /// Counts nodes of `new` not shared with `old`, assuming both have the
    /// same shape.
    fn unshared<K, V>(old: &Arc<Node<K, V>>, new: &Arc<Node<K, V>>) -> usize {
        if Arc::ptr_eq(old, new) {
            return 0;
        }
        match (&**old, &**new) {
            (
                &Node::Bitmap {
                    entries: ref old_entries,
                    ..
                },
                &Node::Bitmap {
                    entries: ref new_entries,
                    ..
                },
            ) => {
                1 + old_entries
                    .iter()
                    .zip(new_entries.iter())
                    .map(|pair| match pair {
                        (&Entry::Branch(ref a), &Entry::Branch(ref b)) => unshared(a, b),
                        _ => 0,
                    })
                    .sum::<usize>()
            }
            _ => 1,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let map: PersistentMap<u64, &str> = PersistentMap::new();
        let map = map.insert(1, "one").insert(2, "two");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.get(&2), Some(&"two"));
        assert_eq!(map.get(&3), None);
    }

    #[test]
    fn test_original_is_untouched() {
        let base: PersistentMap<u64, u64> = (0..100).map(|i| (i, i)).collect();
        let changed = base.insert(7, 700).remove(&8);
        assert_eq!(base.get(&7), Some(&7));
        assert_eq!(base.get(&8), Some(&8));
        assert_eq!(base.len(), 100);
        assert_eq!(changed.get(&7), Some(&700));
        assert_eq!(changed.get(&8), None);
        assert_eq!(changed.len(), 99);
    }

    #[test]
    fn test_replace_keeps_len() {
        let map: PersistentMap<u64, u64> = PersistentMap::new();
        let map = map.insert(5, 1).insert(5, 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&5), Some(&2));
    }

    #[test]
    fn test_remove_missing_shares_root() {
        let map: PersistentMap<u64, u64> = (0..10).map(|i| (i, i)).collect();
        let same = map.remove(&42);
        assert!(map.ptr_eq(&same));
        assert_eq!(same.len(), 10);
    }

    #[test]
    fn test_remove_everything() {
        let mut map: PersistentMap<u64, u64> = (0..500).map(|i| (i, i * 2)).collect();
        for i in 0..500 {
            map = map.remove(&i);
            assert_eq!(map.get(&i), None);
            if i + 1 < 500 {
                assert_eq!(map.get(&(i + 1)), Some(&((i + 1) * 2)));
            }
        }
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        assert_eq!(count_nodes(&map.root), 1);
    }

    #[test]
    fn test_collisions() {
        let map: PersistentMap<u64, u64, Colliding> = (0..64).map(|i| (i, i + 1000)).collect();
        assert_eq!(map.len(), 64);
        for i in 0..64 {
            assert_eq!(map.get(&i), Some(&(i + 1000)));
        }
        assert_eq!(map.get(&64), None);

        let mut shrinking = map.clone();
        for i in (0..64).rev() {
            shrinking = shrinking.remove(&i);
            assert_eq!(shrinking.len(), i as usize);
            assert_eq!(shrinking.get(&i), None);
        }
        assert!(shrinking.is_empty());
        assert_eq!(map.len(), 64);
    }

    #[test]
    fn test_collision_node_splits_on_new_hash() {
        let map: PersistentMap<u64, u64, Colliding> = PersistentMap::default();
        // find two keys sharing a hash and one that does not
        let hasher = Colliding::default();
        let mut same = Vec::new();
        let mut other = None;
        for k in 0..100u64 {
            if hasher.hash_one(k) == hasher.hash_one(0u64) {
                same.push(k);
            } else if other.is_none() {
                other = Some(k);
            }
        }
        let other = other.unwrap();
        let map = map.insert(same[0], 1).insert(same[1], 2).insert(other, 3);
        assert_eq!(map.get(&same[0]), Some(&1));
        assert_eq!(map.get(&same[1]), Some(&2));
        assert_eq!(map.get(&other), Some(&3));
        let map = map.remove(&same[0]);
        assert_eq!(map.get(&same[1]), Some(&2));
        assert_eq!(map.get(&other), Some(&3));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_iter_visits_everything_once() {
        let map: PersistentMap<u64, u64> = (0..1000).map(|i| (i, i)).collect();
        let mut seen: Vec<u64> = map.keys().cloned().collect();
        seen.sort();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
        assert_eq!(map.iter().size_hint(), (1000, Some(1000)));
    }

    #[test]
    fn test_structural_sharing() {
        let base: PersistentMap<u64, u64> = (0..2000).map(|i| (i, i)).collect();
        let total = count_nodes(&base.root);
        let derived = base.insert(1234, 0);

        let fresh = unshared(&base.root, &derived.root);
        assert!(fresh >= 1);
        assert!(fresh <= depth(&derived.root), "{} fresh nodes", fresh);
        assert!(fresh < total);

        // clone is a reference copy
        let cloned = derived.clone();
        assert!(cloned.ptr_eq(&derived));
        assert_eq!(unshared(&derived.root, &cloned.root), 0);
    }
}
