/// render-jail: operator tool for the render worker jail
///
/// Builds a jail the way the render server does, spawns workers under it and
/// reports how they were reclaimed. Also compiles and checks seccomp policies.
///
/// # Usage
/// ```bash
/// render-jail run --backend process --max-workers 4 --workers 6 --exit-code 3
/// render-jail compile-policy worker.policy worker.bpf
/// render-jail run --backend sandboxed-process --seccomp bpf --policy worker.bpf
/// render-jail check-policy --seccomp policy worker.policy
/// ```
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use render_jail::policy::SeccompPolicy;
use render_jail::sandbox::SandboxTemplate;
use render_jail::{BackendKind, Jail, JailConfig, JailError, SeccompMode, WorkerContext};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "render-jail", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn workers in a jail, reap them and print a JSON report
    Run {
        /// JSON jail configuration; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Worker backend (process, thread, sandboxed-process)
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Maximum number of concurrent workers
        #[arg(long)]
        max_workers: Option<usize>,
        /// Seccomp mode (none, bpf, policy, policy-log)
        #[arg(long)]
        seccomp: Option<SeccompMode>,
        /// Seccomp policy or compiled filter file
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Number of workers to attempt to spawn
        #[arg(long, default_value = "1")]
        workers: usize,
        /// Exit code each worker returns, passed through its payload
        #[arg(long, default_value = "0")]
        exit_code: i32,
    },
    /// Compile a textual seccomp policy into a BPF filter file
    CompilePolicy {
        /// Textual policy file
        input: PathBuf,
        /// Output filter file
        output: PathBuf,
    },
    /// Load a policy the way a jail would and report it
    CheckPolicy {
        /// Seccomp mode used to interpret the file
        #[arg(long, default_value = "bpf")]
        seccomp: SeccompMode,
        /// Policy or filter file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        eprintln!("Error: render-jail requires Linux for fork and seccomp");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            backend,
            max_workers,
            seccomp,
            policy,
            workers,
            exit_code,
        } => {
            let mut jail_config = match config {
                Some(path) => JailConfig::from_json_file(&path)?,
                None => JailConfig::default(),
            };
            if let Some(backend) = backend {
                jail_config.backend = backend;
            }
            if let Some(max) = max_workers {
                jail_config.max_worker_count = max;
            }
            if let Some(seccomp) = seccomp {
                jail_config.seccomp = seccomp;
            }
            if policy.is_some() {
                jail_config.seccomp_policy = policy;
            }

            run_workers(&jail_config, workers, exit_code)
        }
        Commands::CompilePolicy { input, output } => {
            let program = SeccompPolicy::from_file(&input)
                .and_then(|policy| policy.compile())
                .with_context(|| format!("Failed to compile {}", input.display()))?;
            program.save(&output)?;

            let report = serde_json::json!({
                "input": input,
                "output": output,
                "instructions": program.len(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::CheckPolicy { seccomp, path } => {
            let template = SandboxTemplate::new(seccomp, Some(&path))
                .with_context(|| format!("Failed to load {}", path.display()))?;

            let report = serde_json::json!({
                "path": path,
                "seccomp": seccomp.as_str(),
                "instructions": template.filter().map(|f| f.len()).unwrap_or(0),
                "logs_failures": template.logs_failures(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Entry routine used by `run`: the payload carries the exit code
fn payload_exit_code(ctx: WorkerContext) -> i32 {
    ctx.payload()
        .try_into()
        .map(i32::from_le_bytes)
        .unwrap_or(1)
}

fn run_workers(config: &JailConfig, count: usize, exit_code: i32) -> Result<()> {
    let mut jail = Jail::from_config(config).context("Failed to create jail")?;
    let payload = exit_code.to_le_bytes();

    let mut spawned = Vec::new();
    let mut rejected = 0usize;
    for _ in 0..count {
        match jail.create_worker(payload_exit_code, &payload) {
            Ok(id) => spawned.push(id),
            Err(JailError::QuotaExceeded { max }) => {
                eprintln!("Quota of {} workers reached, skipping spawn", max);
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut results = Vec::new();
    for id in &spawned {
        let pid = jail.worker(*id).and_then(|w| w.pid()).map(|p| p.as_raw());
        let exit = jail.reap(*id, true)?;
        results.push(serde_json::json!({
            "id": id.to_string(),
            "pid": pid,
            "exit": exit,
        }));
        jail.destroy_worker(*id);
    }

    let report = serde_json::json!({
        "backend": jail.backend_kind().as_str(),
        "sandboxed": jail.is_sandboxed(),
        "max_workers": jail.max_worker_count(),
        "spawned": spawned.len(),
        "rejected": rejected,
        "workers": results,
    });
    jail.destroy();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
