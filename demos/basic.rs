use context_vars::{Context, Registry};
use std::env;
use std::thread;

fn main() {
    let registry = Registry::new();
    let locale = registry.declare_with_default(
        "locale",
        env::var("LANG").unwrap_or_else(|_| "en_US".into()),
    );

    let mut ctx = Context::new();
    println!("the current locale is {}", ctx.get(&locale).unwrap());
    let _token = ctx.set(&locale, "de_DE".into());
    println!("changing locale to {}", ctx.get(&locale).unwrap());

    let snapshot = ctx.copy_active();
    let child_locale = locale.clone();
    thread::spawn(move || {
        snapshot.run(|ctx| {
            println!("the locale in the child thread is {}", ctx.get(&child_locale).unwrap());
            let _ = ctx.set(&child_locale, "fr_FR".into());
            println!("the new locale in the child thread is {}", ctx.get(&child_locale).unwrap());
        });
    }).join().unwrap();

    println!("the locale of the parent thread is again {}", ctx.get(&locale).unwrap());
}
