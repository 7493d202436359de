//! Process fan-out harness
//!
//! Runs the listing from several processes at once. `spawn` re-executes
//! this binary, so workers inherit nothing but the serialized client
//! configuration. `fork` duplicates the running process after the parent
//! has connected, which is where an inherited connection becomes stale.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::process::Command;

use anyhow::{bail, Result};
use clap::ValueEnum;
use forkflight_core::ClientConfig;
use forkflight_flight::{ConnectionFactory, ProcessLocalClient};
use tracing::{info, warn};

use crate::commands::{client_runtime, print_flights};

/// What a forked child does with the parent's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ForkPolicy {
    /// Try the inherited connection, then reconnect in the child
    Shared,
    /// Ignore the inherited connection and connect from scratch
    Separate,
}

/// Re-execute this binary `workers` times and wait for all of them
pub fn spawn_workers(config: &ClientConfig, workers: usize) -> Result<()> {
    let exe = std::env::current_exe()?;
    let client_config = config.to_json()?;
    println!("Parent PID is {}", std::process::id());

    let mut children = Vec::with_capacity(workers);
    for worker in 0..workers {
        let child = Command::new(&exe)
            .arg("worker")
            .arg("--client-config")
            .arg(&client_config)
            .spawn()?;
        info!(worker, pid = child.id(), "spawned worker");
        children.push(child);
    }

    let mut failed = 0;
    for mut child in children {
        let pid = child.id();
        let status = child.wait()?;
        if !status.success() {
            warn!(pid, "worker exited with {}", status);
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} workers failed", failed, workers);
    }
    Ok(())
}

/// Connect, fork `workers` children, then list from every process
#[cfg(unix)]
pub fn fork_workers(config: &ClientConfig, workers: usize, policy: ForkPolicy) -> Result<()> {
    let runtime = client_runtime()?;
    let factory = ConnectionFactory::new(config.clone());
    let connection = runtime.block_on(factory.connect())?;
    let mut client = ProcessLocalClient::with_connection(factory, connection);

    println!("Parent PID is {}", std::process::id());

    // the runtime is idle here: no task or I/O is in flight across the fork
    let mut children = Vec::with_capacity(workers);
    for _ in 0..workers {
        match fork_process()? {
            Forked::Child => {
                let code = panic::catch_unwind(AssertUnwindSafe(|| run_child(&mut client, policy)))
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("worker panicked")));
                exit_child(match code {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("[PID: {}]: {:#}", std::process::id(), e);
                        1
                    }
                });
            }
            Forked::Parent(pid) => {
                info!(pid, "forked worker");
                children.push(pid);
            }
        }
    }

    let parent = runtime.block_on(async {
        let connection = client.connection().await?;
        print_flights(connection).await
    });

    let mut failed = 0;
    for pid in children {
        let code = wait_for(pid)?;
        if code != 0 {
            warn!(pid, code, "worker failed");
            failed += 1;
        }
    }

    parent?;
    if failed > 0 {
        bail!("{} of {} workers failed", failed, workers);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn fork_workers(_config: &ClientConfig, _workers: usize, _policy: ForkPolicy) -> Result<()> {
    bail!("fork is only available on unix")
}

/// Body of a forked child; never returns into the parent's code path
#[cfg(unix)]
fn run_child(client: &mut ProcessLocalClient, policy: ForkPolicy) -> Result<()> {
    let pid = std::process::id();

    if policy == ForkPolicy::Shared {
        if let Some(inherited) = client.cached() {
            // fails before any I/O, so no runtime is needed to observe it
            match futures::executor::block_on(print_flights(inherited)) {
                Err(e) if e.is_stale() => {
                    println!("[PID: {}]: inherited connection refused: {}", pid, e)
                }
                Err(e) => return Err(e.into()),
                Ok(_) => bail!("inherited connection was used from a forked child"),
            }
        }
    }

    let runtime = client_runtime()?;
    runtime.block_on(async {
        match policy {
            ForkPolicy::Shared => {
                let connection = client.connection().await?;
                print_flights(connection).await?;
            }
            ForkPolicy::Separate => {
                let connection = client.factory().connect().await?;
                print_flights(&connection).await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    // the child leaves through `_exit`; skip the runtime shutdown
    std::mem::forget(runtime);
    Ok(())
}

#[cfg(unix)]
enum Forked {
    Child,
    Parent(libc::pid_t),
}

#[cfg(unix)]
fn fork_process() -> Result<Forked> {
    let _ = std::io::stdout().flush();

    // SAFETY: the child only builds fresh state and leaves through `_exit`.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(std::io::Error::last_os_error().into()),
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent(pid)),
    }
}

/// Exit a forked child without running destructors inherited from the parent
#[cfg(unix)]
fn exit_child(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    // SAFETY: `_exit` only terminates the calling process.
    unsafe { libc::_exit(code) }
}

#[cfg(unix)]
fn wait_for(pid: libc::pid_t) -> Result<i32> {
    let mut status = 0;

    // SAFETY: `pid` is a child of this process and `status` outlives the call.
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    if waited == -1 {
        return Err(std::io::Error::last_os_error().into());
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(-1)
    }
}
