//! Tracks a request id and the authenticated user through a handful of
//! cooperative "tasks" that are driven round-robin by a toy scheduler.
//!
//! Run with `RUST_LOG=context_vars=trace` to see the engine at work.
use context_vars::{Context, ContextVar, Registry, Snapshot, TaskTable};
use tracing_subscriber::EnvFilter;

struct Vars {
    request_id: ContextVar<String>,
    user: ContextVar<Option<String>>,
}

fn log(ctx: &Context, vars: &Vars, message: &str) {
    let rid = ctx.get(&vars.request_id).unwrap();
    let user = ctx.get(&vars.user).unwrap();
    println!("  [{}] [user:{:?}] {}", rid, user, message);
}

/// One step of a request handler.  Returns `false` once the handler is done.
fn step(ctx: &mut Context, vars: &Vars, task: usize, stage: usize) -> bool {
    match stage {
        0 => {
            let _ = ctx.set(&vars.request_id, format!("req-{}", task));
            log(ctx, vars, "request started");
        }
        1 => {
            let user = if task % 2 == 0 { "admin_user" } else { "guest_user" };
            let _ = ctx.set(&vars.user, Some(user.to_string()));
            log(ctx, vars, "authenticated");
        }
        2 => log(ctx, vars, "processing"),
        _ => {
            log(ctx, vars, "request completed");
            return false;
        }
    }
    true
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = Registry::new();
    let vars = Vars {
        request_id: registry.declare_with_default("request_id", "no-request".to_string()),
        user: registry.declare_with_default("auth_user", None),
    };

    let mut tasks = TaskTable::new();
    tasks.on_task_start(0usize, Snapshot::empty());
    tasks
        .enter(&0, |root| {
            for task in 1..=3 {
                root.spawn(task);
            }
        })
        .unwrap();

    let mut stages = vec![0; 4];
    let mut running: Vec<usize> = (1..=3).collect();
    while !running.is_empty() {
        running.retain(|&task| {
            let stage = stages[task];
            stages[task] += 1;
            let more = tasks.enter(&task, |ctx| step(ctx, &vars, task, stage)).unwrap();
            if !more {
                tasks.on_task_exit(&task);
            }
            more
        });
    }

    let root = tasks.context(&0).unwrap();
    log(root, &vars, "all requests handled");
}
