use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sovereign::doctor::Doctor;
use sovereign::identity::CredentialSource;
use sovereign::lifecycle::{DeployOptions, StartOptions, StartOutcome};
use sovereign::{
    AdbDevice, IdentityManager, LifecycleController, NetProber, ServiceDescriptor, ServiceTable,
    SovereignError, SovereignOptions, TailscalePlane,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle orchestration for sovereign guest VMs
#[derive(Parser, Debug)]
#[command(name = "sovereign")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: $SOVEREIGN_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// adb serial of the target device
    #[arg(long, global = true)]
    device_serial: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
#[group(multiple = false)]
struct Target {
    /// PostgreSQL guest
    #[arg(long)]
    sql: bool,
    /// Forgejo guest
    #[arg(long)]
    forge: bool,
    /// Vaultwarden guest
    #[arg(long)]
    vault: bool,
    /// Any guest by name
    #[arg(long, value_name = "NAME")]
    service: Option<String>,
}

impl Target {
    fn name(&self) -> Option<&str> {
        if self.sql {
            Some("sql")
        } else if self.forge {
            Some("forge")
        } else if self.vault {
            Some("vault")
        } else {
            self.service.as_deref()
        }
    }

    fn resolve<'a>(&self, table: &'a ServiceTable) -> anyhow::Result<&'a ServiceDescriptor> {
        let name = self.name().ok_or_else(|| {
            anyhow::anyhow!(
                "no service selected; pass --sql, --forge, --vault or --service <NAME> (known: {})",
                table.names().join(", ")
            )
        })?;
        Ok(table.get(name)?)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push artifacts, credentials and the boot watchdog to the device
    Deploy {
        #[command(flatten)]
        target: Target,
        /// Replace the data volume and drop the old identity
        #[arg(long)]
        fresh_data: bool,
    },
    /// Start a guest and wait until it is ready
    Start {
        #[command(flatten)]
        target: Target,
        /// Do not check upstream dependencies first
        #[arg(long)]
        skip_deps: bool,
    },
    /// Stop a guest and tear down its network
    Stop {
        #[command(flatten)]
        target: Target,
    },
    /// Stop a guest, drop its identity and delete it from the device
    Remove {
        #[command(flatten)]
        target: Target,
    },
    /// Delete a guest's overlay-network registrations
    Clean {
        #[command(flatten)]
        target: Target,
    },
    /// Verify a running guest
    Test {
        #[command(flatten)]
        target: Target,
    },
    /// Inspect a guest, or the whole device without a target
    Diagnose {
        #[command(flatten)]
        target: Target,
    },
    /// Repair a guest, or the shared infrastructure without a target
    Fix {
        #[command(flatten)]
        target: Target,
    },
    /// Show every guest's process and identity
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        if let Some(next) = e
            .downcast_ref::<SovereignError>()
            .and_then(SovereignError::next_command)
        {
            eprintln!("Next: {}", next);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut options = SovereignOptions::load(cli.config.as_deref())?;
    if let Some(serial) = cli.device_serial {
        options.device.serial = Some(serial);
    }
    let _guard = sovereign::init_logging(&options)?;

    let table = ServiceTable::builtin(&options)?;
    let identity = Arc::new(IdentityManager::new(
        Arc::new(TailscalePlane::new(&options.identity)?),
        CredentialSource::from_options(&options.identity),
        options.identity.manual_url.clone(),
    ));
    let controller = LifecycleController::new(
        Arc::new(AdbDevice::new(&options)),
        identity,
        Arc::new(NetProber::new()?),
        options,
    );
    let doctor = Doctor::new(&controller);

    match cli.command {
        Command::Deploy { target, fresh_data } => {
            let service = target.resolve(&table)?;
            let report = controller
                .deploy(service, DeployOptions { fresh_data })
                .await?;
            println!(
                "{} deployed (data volume {:?}) in {}ms",
                service.display_name(),
                report.data_volume,
                report.metrics.total_duration_ms
            );
            println!("Next: sovereign start --{}", service.name());
        }

        Command::Start { target, skip_deps } => {
            let service = target.resolve(&table)?;
            let opts = StartOptions {
                skip_dependency_check: skip_deps,
            };
            match controller.start(service, opts).await? {
                StartOutcome::AlreadyRunning { pid } => {
                    println!("{} already running (PID {})", service.display_name(), pid);
                }
                StartOutcome::Started { pid, boot } => {
                    let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into());
                    println!(
                        "{} ready (PID {}) after {:.1}s",
                        service.display_name(),
                        pid,
                        boot.elapsed.as_secs_f64()
                    );
                    println!("Next: sovereign test --{}", service.name());
                }
            }
        }

        Command::Stop { target } => {
            let service = target.resolve(&table)?;
            let outcome = controller.stop(service).await?;
            match outcome.pid_stopped {
                Some(pid) if outcome.forced => println!("{} killed (PID {})", service.display_name(), pid),
                Some(pid) => println!("{} stopped (PID {})", service.display_name(), pid),
                None => println!("{} was not running; cleaned up", service.display_name()),
            }
        }

        Command::Remove { target } => {
            let service = target.resolve(&table)?;
            controller.remove(service).await?;
            println!("{} removed from device", service.display_name());
            println!("To redeploy: sovereign deploy --{}", service.name());
        }

        Command::Clean { target } => {
            let service = target.resolve(&table)?;
            let report = controller.clean(service).await?;
            if !report.checked {
                println!("Control plane unavailable; registrations not checked");
            } else {
                println!(
                    "{} registration(s) matched, {} deleted, {} remaining",
                    report.matched.len(),
                    report.deleted.len(),
                    report.remaining()
                );
            }
        }

        Command::Test { target } => {
            let service = target.resolve(&table)?;
            let report = doctor.verify(service).await;
            print!("{}", report);
            report.into_result()?;
        }

        Command::Diagnose { target } => match target.name() {
            Some(_) => {
                let service = target.resolve(&table)?;
                print!("{}", doctor.diagnose(service).await?);
            }
            None => print!("{}", doctor.diagnose_all(&table).await?),
        },

        Command::Fix { target } => {
            let report = match target.name() {
                Some(_) => doctor.fix(target.resolve(&table)?).await?,
                None => doctor.fix_infrastructure().await?,
            };
            print!("{}", report);
        }

        Command::Status => {
            for service in table.iter() {
                let pid = controller
                    .find_pid(service)
                    .await
                    .with_context(|| format!("looking up {}", service.name()))?;
                let status = controller.identity().query(service.identity_host()).await;
                let process = pid
                    .map(|p| format!("running (PID {})", p))
                    .unwrap_or_else(|| "stopped".to_string());
                let overlay = match (status.connected, status.registered) {
                    (true, _) => format!(
                        "online {}",
                        status.fqdn.as_deref().unwrap_or(service.identity_host())
                    ),
                    (false, true) => "offline".to_string(),
                    (false, false) => "unregistered".to_string(),
                };
                println!("{:<6} {:<24} {}", service.name(), process, overlay);
            }
        }
    }

    Ok(())
}
