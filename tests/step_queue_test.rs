//! Tests for deferred steps and scoped HOME windows

use std::cell::RefCell;
use std::rc::Rc;

use rbenv_shellout::{
    Config, EnvironmentStore, Error, MemoryEnvironment, ProvisionContext, StaticUserDatabase,
    StepQueue,
};

type Log = Rc<RefCell<Vec<String>>>;

fn users() -> StaticUserDatabase {
    StaticUserDatabase::new()
        .with_user("deploy", "/srv/deploy")
        .with_user("app", "/home/app")
}

/// Queue a step that records the HOME it observed
fn record_home(queue: &mut StepQueue, label: &str, log: &Log) {
    let (label, log) = (label.to_string(), Rc::clone(log));
    queue.enqueue(format!("record {}", label), move |ctx| {
        let home = ctx.env().get("HOME").unwrap_or_default();
        log.borrow_mut().push(format!("{}={}", label, home));
        Ok(())
    });
}

#[test]
fn test_home_restored_after_window() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();
    let log: Log = Rc::default();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("deploy", |q| record_home(q, "inside", &log));
    record_home(&mut queue, "after", &log);

    let mut ctx = ProvisionContext::new(&env, &db);
    let report = queue.run(&mut ctx).unwrap();

    assert_eq!(*log.borrow(), vec!["inside=/srv/deploy", "after=/root"]);
    assert_eq!(env.get("HOME").as_deref(), Some("/root"));
    assert_eq!(env.get("OLD_HOME"), None);
    assert_eq!(report.executed.len(), 4);
    assert!(report.unwound.is_empty());
}

#[test]
fn test_unknown_user_gets_synthesized_home() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();
    let log: Log = Rc::default();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("ghost", |q| record_home(q, "inside", &log));

    let mut ctx = ProvisionContext::new(&env, &db);
    queue.run(&mut ctx).unwrap();
    assert_eq!(*log.borrow(), vec!["inside=/home/ghost"]);
    assert_eq!(env.get("HOME").as_deref(), Some("/root"));
}

#[test]
fn test_fallback_parent_from_config() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();
    let log: Log = Rc::default();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("ghost", |q| record_home(q, "inside", &log));

    let config = Config {
        home_parent: "/export/home".into(),
        ..Config::default()
    };
    let mut ctx = ProvisionContext::new(&env, &db).with_config(config);
    queue.run(&mut ctx).unwrap();
    assert_eq!(*log.borrow(), vec!["inside=/export/home/ghost"]);
}

#[test]
fn test_two_users_never_interleave() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();
    let log: Log = Rc::default();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("deploy", |q| record_home(q, "first", &log));
    queue.with_home_for_user("app", |q| record_home(q, "second", &log));
    record_home(&mut queue, "end", &log);

    let names: Vec<String> = queue.names().iter().map(|n| n.to_string()).collect();
    assert!(names[0].starts_with("set HOME for deploy"));
    assert_eq!(names[1], "record first");
    assert!(names[2].starts_with("unset HOME for deploy"));
    assert!(names[3].starts_with("set HOME for app"));
    assert_eq!(names[4], "record second");
    assert!(names[5].starts_with("unset HOME for app"));

    let mut ctx = ProvisionContext::new(&env, &db);
    let report = queue.run(&mut ctx).unwrap();
    assert_eq!(report.executed, names);
    assert_eq!(
        *log.borrow(),
        vec!["first=/srv/deploy", "second=/home/app", "end=/root"]
    );
}

#[test]
fn test_nested_windows_restore_in_order() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();
    let log: Log = Rc::default();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("deploy", |q| {
        record_home(q, "outer", &log);
        q.with_home_for_user("app", |q| record_home(q, "inner", &log));
        record_home(q, "outer-again", &log);
    });

    let mut ctx = ProvisionContext::new(&env, &db);
    queue.run(&mut ctx).unwrap();
    assert_eq!(
        *log.borrow(),
        vec!["outer=/srv/deploy", "inner=/home/app", "outer-again=/srv/deploy"]
    );
    assert_eq!(env.get("HOME").as_deref(), Some("/root"));
}

#[test]
fn test_failed_step_still_restores_home() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();
    let log: Log = Rc::default();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("deploy", |q| {
        q.enqueue("git clone", |_| Err(Error::EmptyCommand));
        record_home(q, "never", &log);
    });

    let mut ctx = ProvisionContext::new(&env, &db);
    let err = queue.run(&mut ctx).unwrap_err();
    match err {
        Error::Step { step, source } => {
            assert_eq!(step, "git clone");
            assert!(matches!(*source, Error::EmptyCommand));
        }
        other => panic!("expected a step error, got {:?}", other),
    }

    assert!(log.borrow().is_empty());
    assert_eq!(env.get("HOME").as_deref(), Some("/root"));
    assert_eq!(env.get("OLD_HOME"), None);
    assert!(ctx.open_windows().is_empty());

    // the window's steps cannot run again without their opening step
    assert!(queue.is_empty());
}

#[test]
fn test_rerunning_failed_queue_runs_nothing() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();
    let log: Log = Rc::default();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("deploy", |q| {
        q.enqueue("bundle install", |_| Err(Error::EmptyCommand));
        record_home(q, "inside", &log);
    });

    let mut ctx = ProvisionContext::new(&env, &db);
    assert!(queue.run(&mut ctx).is_err());
    let report = queue.run(&mut ctx).unwrap();
    assert!(report.executed.is_empty());
    assert!(log.borrow().is_empty());
    assert_eq!(env.get("HOME").as_deref(), Some("/root"));
}

#[test]
fn test_panicking_step_still_restores_home() {
    let env = MemoryEnvironment::new().with_var("HOME", "/root");
    let db = users();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("deploy", |q| {
        q.enqueue("explode", |_| panic!("provisioning aborted"));
    });

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut ctx = ProvisionContext::new(&env, &db);
        let _ = queue.run(&mut ctx);
    }));
    assert!(result.is_err());
    assert_eq!(env.get("HOME").as_deref(), Some("/root"));
    assert!(queue.is_empty());
}

#[test]
fn test_previously_unset_home_is_unset_again() {
    let env = MemoryEnvironment::new();
    let db = users();

    let mut queue = StepQueue::new();
    queue.with_home_for_user("deploy", |_| {});

    let mut ctx = ProvisionContext::new(&env, &db);
    queue.run(&mut ctx).unwrap();
    assert_eq!(env.get("HOME"), None);
}

#[cfg(unix)]
mod with_commands {
    use super::*;
    use rbenv_shellout::{ShellOut, SystemCommandRunner};

    #[test]
    fn test_command_inside_window_sees_window_home() {
        let env = MemoryEnvironment::new().with_var("HOME", "/root");
        let db = users();
        let log: Log = Rc::default();
        let shell = Rc::new(ShellOut::new(None, SystemCommandRunner::new(), users()));

        let mut queue = StepQueue::new();
        let (step_shell, step_log) = (Rc::clone(&shell), Rc::clone(&log));
        queue.with_home_for_user("deploy", move |q| {
            q.enqueue("git config", move |ctx| {
                let output = ctx.shell_out(&*step_shell, &["sh", "-c", "printf '%s' \"$HOME\""], None)?;
                step_log.borrow_mut().push(output.stdout);
                Ok(())
            });
        });

        let mut ctx = ProvisionContext::new(&env, &db);
        queue.run(&mut ctx).unwrap();
        assert_eq!(*log.borrow(), vec!["/srv/deploy"]);
    }

    #[test]
    fn test_rbenv_user_home_wins_over_window() {
        let env = MemoryEnvironment::new().with_var("HOME", "/root");
        let db = users();
        let log: Log = Rc::default();
        let shell = Rc::new(ShellOut::new(
            Some("app".to_string()),
            SystemCommandRunner::new(),
            users(),
        ));

        let mut queue = StepQueue::new();
        let (step_shell, step_log) = (Rc::clone(&shell), Rc::clone(&log));
        queue.with_home_for_user("deploy", move |q| {
            q.enqueue("rbenv install", move |ctx| {
                let output = ctx.shell_out(&*step_shell, &["sh", "-c", "printf '%s' \"$HOME\""], None)?;
                step_log.borrow_mut().push(output.stdout);
                Ok(())
            });
        });

        let mut ctx = ProvisionContext::new(&env, &db);
        queue.run(&mut ctx).unwrap();
        assert_eq!(*log.borrow(), vec!["/home/app"]);
    }

    #[test]
    fn test_failing_command_aborts_and_restores() {
        let env = MemoryEnvironment::new().with_var("HOME", "/root");
        let db = users();
        let shell = Rc::new(ShellOut::new(None, SystemCommandRunner::new(), users()));

        let mut queue = StepQueue::new();
        let step_shell = Rc::clone(&shell);
        queue.with_home_for_user("deploy", move |q| {
            q.enqueue("failing build", move |ctx| {
                ctx.shell_out(&*step_shell, &["sh", "-c", "exit 7"], None)?;
                Ok(())
            });
        });

        let mut ctx = ProvisionContext::new(&env, &db);
        let err = queue.run(&mut ctx).unwrap_err();
        match err {
            Error::Step { source, .. } => {
                assert!(matches!(*source, Error::CommandFailed { exit_code: Some(7), .. }));
            }
            other => panic!("expected a step error, got {:?}", other),
        }
        assert_eq!(env.get("HOME").as_deref(), Some("/root"));
    }
}
