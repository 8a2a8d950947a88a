use context_vars::{ContextError, Registry, SharedTaskTable, Snapshot, TaskTable};
use std::thread;

#[test]
fn test_spawn_scenario() {
    let registry = Registry::new();
    let v1 = registry.declare::<&'static str>("V1");
    let mut tasks = TaskTable::new();
    tasks.on_task_start("T1", Snapshot::empty());

    let k1 = tasks.enter(&"T1", |ctx| ctx.set(&v1, "A")).unwrap();

    let seed = tasks.on_task_spawn(&"T1").unwrap();
    tasks.on_task_start("T2", seed);
    assert_eq!(*tasks.enter(&"T2", |ctx| ctx.get(&v1)).unwrap().unwrap(), "A");

    let _k2 = tasks.enter(&"T2", |ctx| ctx.set(&v1, "B")).unwrap();
    assert_eq!(*tasks.enter(&"T1", |ctx| ctx.get(&v1)).unwrap().unwrap(), "A");
    assert_eq!(*tasks.enter(&"T2", |ctx| ctx.get(&v1)).unwrap().unwrap(), "B");

    tasks.enter(&"T1", |ctx| ctx.reset(k1)).unwrap().unwrap();
    let err = tasks.enter(&"T1", |ctx| ctx.get(&v1)).unwrap().unwrap_err();
    assert_eq!(
        err,
        ContextError::NotBound {
            name: "V1".to_string()
        }
    );
    assert_eq!(*tasks.enter(&"T2", |ctx| ctx.get(&v1)).unwrap().unwrap(), "B");
}

#[test]
fn test_siblings_are_isolated() {
    let registry = Registry::new();
    let v = registry.declare_with_default("v", 0u32);
    let mut tasks = TaskTable::new();
    tasks.on_task_start(0u32, Snapshot::empty());
    let _ = tasks.enter(&0, |ctx| ctx.set(&v, 1)).unwrap();

    for child in 1..=2 {
        let seed = tasks.on_task_spawn(&0).unwrap();
        tasks.on_task_start(child, seed);
    }
    let _ = tasks.enter(&1, |ctx| ctx.set(&v, 10)).unwrap();

    assert_eq!(*tasks.context(&1).unwrap().get(&v).unwrap(), 10);
    assert_eq!(*tasks.context(&2).unwrap().get(&v).unwrap(), 1);
    assert_eq!(*tasks.context(&0).unwrap().get(&v).unwrap(), 1);
}

#[test]
fn test_parent_writes_after_spawn_are_invisible() {
    let registry = Registry::new();
    let v = registry.declare::<u32>("v");
    let mut tasks = TaskTable::new();
    tasks.on_task_start(1u8, Snapshot::empty());
    let _ = tasks.context_mut(&1).unwrap().set(&v, 1);

    let seed = tasks.on_task_spawn(&1).unwrap();
    assert!(seed.ptr_eq(&tasks.context(&1).unwrap().copy_active()));
    tasks.on_task_start(2, seed);

    let _ = tasks.context_mut(&1).unwrap().set(&v, 2);
    assert_eq!(*tasks.context(&2).unwrap().get(&v).unwrap(), 1);
}

#[test]
fn test_detached_spawn_starts_new_flow() {
    let registry = Registry::new();
    let v = registry.declare_with_default("v", 42u32);
    let mut tasks = TaskTable::new();
    tasks.on_task_start(1u8, Snapshot::empty());
    let _ = tasks.enter(&1, |ctx| ctx.set(&v, 11111)).unwrap();

    let seed = tasks.on_task_spawn_detached(&1).unwrap();
    assert!(seed.is_empty());
    tasks.on_task_start(2, seed);
    assert_eq!(*tasks.context(&2).unwrap().get(&v).unwrap(), 42);
    assert!(tasks.on_task_spawn_detached(&3).is_err());
}

#[test]
fn test_exit_forgets_context() {
    let mut tasks = TaskTable::new();
    tasks.on_task_start(1u8, Snapshot::empty());
    assert!(tasks.contains(&1));
    assert!(tasks.on_task_exit(&1).is_some());
    assert!(!tasks.contains(&1));
    assert!(tasks.is_empty());
    match tasks.on_task_spawn(&1) {
        Err(ContextError::UnknownTask { .. }) => {}
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_shared_table_across_workers() {
    let registry = Registry::new();
    let request = registry.declare::<String>("request_id");
    let tasks = SharedTaskTable::new();
    tasks.on_task_start(0usize, Snapshot::empty());
    let _ = tasks
        .enter(0, |ctx| ctx.set(&request, "root".to_string()))
        .unwrap();

    for child in 1..=8 {
        let seed = tasks.on_task_spawn(&0).unwrap();
        tasks.on_task_start(child, seed);
    }

    let workers: Vec<_> = (1..=8)
        .map(|child| {
            let tasks = tasks.clone();
            let request = request.clone();
            thread::spawn(move || {
                for round in 0..50 {
                    tasks
                        .enter(child, |ctx| {
                            assert!(ctx.get(&request).unwrap().starts_with(
                                if round == 0 { "root" } else { "req-" }
                            ));
                            let _ = ctx.set(&request, format!("req-{}-{}", child, round));
                        })
                        .unwrap();
                    thread::yield_now();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(
        *tasks.snapshot(&0).unwrap().lookup(&request).unwrap(),
        "root"
    );
    for child in 1..=8 {
        let value = tasks.snapshot(&child).unwrap().lookup(&request).unwrap();
        assert_eq!(*value, format!("req-{}-49", child));
    }
    assert_eq!(tasks.len(), 9);
}

#[test]
fn test_spawn_while_running_sees_spawn_instant() {
    let registry = Registry::new();
    let v = registry.declare::<u32>("v");
    let mut tasks = TaskTable::new();
    tasks.on_task_start(1u32, Snapshot::empty());

    tasks
        .enter(&1, |task| {
            let _ = task.set(&v, 1);
            let seed = task.spawn(2);
            assert_eq!(seed.lookup(&v).as_deref(), Some(&1));
            let _ = task.set(&v, 2);
        })
        .unwrap();

    assert_eq!(*tasks.context(&2).unwrap().get(&v).unwrap(), 1);
    assert_eq!(*tasks.context(&1).unwrap().get(&v).unwrap(), 2);
    assert!(!tasks.is_running(&1));
}

#[test]
fn test_running_parent_is_not_unknown() {
    let registry = Registry::new();
    let v = registry.declare::<u32>("v");
    let tasks = SharedTaskTable::new();
    tasks.on_task_start(1u32, Snapshot::empty());

    tasks
        .enter(1, |task| {
            let _ = task.set(&v, 7);
            assert!(tasks.is_running(&1));
            assert_eq!(
                tasks.on_task_spawn(&1).unwrap_err(),
                ContextError::TaskRunning {
                    task: "1".to_string()
                }
            );
            task.spawn(2);
            let _ = task.set(&v, 8);
        })
        .unwrap();

    let seen = tasks.enter(2, |task| task.get(&v)).unwrap().unwrap();
    assert_eq!(*seen, 7);
    assert_eq!(*tasks.snapshot(&1).unwrap().lookup(&v).unwrap(), 8);
    assert!(tasks.on_task_exit(&2).is_some());
    assert!(!tasks.contains(&2));
}

#[test]
fn test_spawn_detached_while_running() {
    let registry = Registry::new();
    let v = registry.declare_with_default("v", 42u32);
    let tasks = SharedTaskTable::new();
    tasks.on_task_start("parent", Snapshot::empty());

    tasks
        .enter("parent", |task| {
            let _ = task.set(&v, 11111);
            assert_eq!(*task.task(), "parent");
            task.spawn_detached("child");
        })
        .unwrap();

    let seen = tasks.enter("child", |task| task.get(&v)).unwrap().unwrap();
    assert_eq!(*seen, 42);
}
