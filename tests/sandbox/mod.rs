/// Seccomp policy loading and sandboxed worker tests
use crate::{allow_all_program, create_sandboxed_jail, write_temp_file};
use nix::sys::signal::Signal;
use render_jail::policy::SeccompPolicy;
use render_jail::sandbox::SandboxTemplate;
use render_jail::seccomp::{is_seccomp_supported, FILTER_INSTRUCTION_SIZE, MAX_FILTER_INSTRUCTIONS};
use render_jail::{BackendKind, Jail, JailConfig, JailError, SeccompMode, WorkerExit};
use serial_test::serial;

#[test]
fn test_empty_filter_file_is_malformed() {
    let file = write_temp_file(&[]);
    let err = create_sandboxed_jail(SeccompMode::Bpf, file.path(), 1).unwrap_err();
    assert!(matches!(err, JailError::MalformedFilter { .. }), "{:?}", err);
}

#[test]
fn test_partial_instruction_is_malformed() {
    for len in [1, 7, 9, 12, 15] {
        let file = write_temp_file(&vec![0u8; len]);
        let err = create_sandboxed_jail(SeccompMode::Bpf, file.path(), 1).unwrap_err();
        assert!(
            matches!(err, JailError::MalformedFilter { .. }),
            "length {}: {:?}",
            len,
            err
        );
    }
}

#[test]
fn test_whole_instructions_load() {
    let mut bytes = allow_all_program().to_bytes();
    bytes.extend(allow_all_program().to_bytes());
    assert_eq!(bytes.len(), 2 * FILTER_INSTRUCTION_SIZE);

    let file = write_temp_file(&bytes);
    let jail =
        create_sandboxed_jail(SeccompMode::Bpf, file.path(), 1).expect("Failed to load filter");
    assert!(jail.is_sandboxed());
    assert_eq!(jail.sandbox().unwrap().filter().unwrap().len(), 2);
    jail.destroy();
}

#[test]
fn test_oversized_filter_is_malformed() {
    let file = write_temp_file(&vec![0u8; (MAX_FILTER_INSTRUCTIONS + 1) * FILTER_INSTRUCTION_SIZE]);
    let err = create_sandboxed_jail(SeccompMode::Bpf, file.path(), 1).unwrap_err();
    assert!(matches!(err, JailError::MalformedFilter { .. }));
}

#[test]
fn test_bad_textual_policy_fails_construction() {
    let file = write_temp_file(b"read: 1\nwrite 1\n");
    let err = create_sandboxed_jail(SeccompMode::Policy, file.path(), 1).unwrap_err();
    assert!(matches!(err, JailError::Policy { line: 2, .. }), "{:?}", err);
}

#[test]
fn test_compiled_policy_loads_back_unchanged() {
    let policy = SeccompPolicy::parse("exit_group: 1\nread: 1\nwrite: return 1\n").unwrap();
    let program = policy.compile().unwrap();
    let file = write_temp_file(&program.to_bytes());

    let template = SandboxTemplate::new(SeccompMode::Bpf, Some(file.path())).unwrap();
    assert_eq!(template.filter(), Some(&program));
}

#[test]
fn test_derive_leaves_template_untouched() {
    let file = write_temp_file(b"exit_group: 1\n");
    let template = SandboxTemplate::new(SeccompMode::PolicyLog, Some(file.path())).unwrap();
    let before = template.filter().cloned();

    for _ in 0..3 {
        assert!(template.derive().unwrap().has_filter());
    }
    assert_eq!(template.filter().cloned(), before);
    assert!(template.logs_failures());
}

#[test]
#[serial]
fn test_sandbox_without_filter_sets_no_new_privs() {
    let config = JailConfig {
        max_worker_count: 1,
        backend: BackendKind::SandboxedProcess,
        ..Default::default()
    };
    let mut jail = Jail::from_config(&config).expect("Failed to create jail");
    assert!(jail.sandbox().unwrap().filter().is_none());

    let id = jail
        .create_worker(|_| unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) }, b"")
        .expect("Failed to spawn");
    assert_eq!(jail.reap(id, true).unwrap(), WorkerExit::Exited(1));

    jail.destroy_worker(id);
    jail.destroy();
}

#[test]
#[serial]
fn test_sandboxed_worker_runs_under_allow_all_filter() {
    if !is_seccomp_supported() {
        eprintln!("Skipping: seccomp not available");
        return;
    }

    let file = write_temp_file(&allow_all_program().to_bytes());
    let mut jail =
        create_sandboxed_jail(SeccompMode::Bpf, file.path(), 2).expect("Failed to create jail");

    let id = jail.create_worker(|ctx| ctx.payload()[0] as i32, &[3]).expect("Failed to spawn");
    assert!(jail.worker(id).unwrap().pid().is_some());
    assert_eq!(jail.reap(id, true).unwrap(), WorkerExit::Exited(3));

    jail.destroy_worker(id);
    jail.destroy();
}

#[test]
#[serial]
fn test_policy_kills_worker_on_forbidden_syscall() {
    if !is_seccomp_supported() {
        eprintln!("Skipping: seccomp not available");
        return;
    }

    let file = write_temp_file(b"# only exiting is allowed\nexit_group: 1\nexit: 1\n");
    let mut jail =
        create_sandboxed_jail(SeccompMode::Policy, file.path(), 1).expect("Failed to create jail");

    let id = jail
        .create_worker(
            |_| {
                unsafe { libc::getppid() };
                0
            },
            b"",
        )
        .expect("Failed to spawn");
    assert_eq!(
        jail.reap(id, true).unwrap(),
        WorkerExit::Signaled(Signal::SIGSYS as i32)
    );

    jail.destroy_worker(id);
    jail.destroy();
}

#[test]
#[serial]
fn test_policy_errno_action() {
    if !is_seccomp_supported() {
        eprintln!("Skipping: seccomp not available");
        return;
    }

    let file = write_temp_file(b"exit_group: 1\ngetppid: return 1\n");
    let mut jail =
        create_sandboxed_jail(SeccompMode::Policy, file.path(), 1).expect("Failed to create jail");

    let id = jail
        .create_worker(
            |_| {
                let ret = unsafe { libc::getppid() };
                let errno = std::io::Error::last_os_error().raw_os_error();
                if ret == -1 && errno == Some(libc::EPERM) {
                    0
                } else {
                    1
                }
            },
            b"",
        )
        .expect("Failed to spawn");
    assert_eq!(jail.reap(id, true).unwrap(), WorkerExit::Exited(0));

    jail.destroy_worker(id);
    jail.destroy();
}

#[test]
#[serial]
fn test_policy_log_mode_does_not_change_enforcement() {
    if !is_seccomp_supported() {
        eprintln!("Skipping: seccomp not available");
        return;
    }

    let file = write_temp_file(b"exit_group: 1\ngetppid: 1\n");
    let mut jail = create_sandboxed_jail(SeccompMode::PolicyLog, file.path(), 1)
        .expect("Failed to create jail");
    assert!(jail.sandbox().unwrap().logs_failures());

    let id = jail
        .create_worker(
            |_| {
                let parent = unsafe { libc::getppid() };
                if parent > 0 {
                    0
                } else {
                    1
                }
            },
            b"",
        )
        .expect("Failed to spawn");
    assert_eq!(jail.reap(id, true).unwrap(), WorkerExit::Exited(0));

    jail.destroy_worker(id);
    jail.destroy();
}
