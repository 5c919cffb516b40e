use clap::Parser;
use inquire::Confirm;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use virtup::cli::{Cli, Command, CreateArgs, ShowCommand};
use virtup::config::{self, Settings};
use virtup::error::VirtupError;
use virtup::instance::{
    BuildOptions, CloneOptions, Context, HostLifecycle, InstanceSummary, template_instance_name,
};
use virtup::inventory;
use virtup::logging;
use virtup::paths::Paths;
use virtup::ssh::LoginMode;
use virtup::util::validate_name;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Terminal layer: RUST_LOG wins, else the verbosity flags.
    let default_level = if cli.debug {
        "virtup=debug"
    } else if cli.quiet {
        "virtup=error"
    } else {
        "virtup=info"
    };
    let terminal_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(terminal_filter);

    // File layer: virtup=debug into the activity log, dropped until activated
    let activity_log = logging::ActivityLog::default();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(activity_log.clone())
        .with_filter(EnvFilter::new("virtup=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let paths = Paths::from_env();

    // Handle init before loading settings; it creates them
    if let Command::Init { force } = cli.command {
        return virtup::init::run(&paths, force).map_err(Into::into);
    }

    let settings = config::load_settings(&paths)?;

    if let Command::Show { what } = cli.command {
        match what {
            ShowCommand::Paths => show_paths(&paths),
            ShowCommand::Templates => show_templates(&settings),
        }
        return Ok(());
    }

    // Activate file logging for commands that change instance state
    if matches!(
        cli.command,
        Command::Create(_) | Command::Delete { .. } | Command::Start { .. } | Command::Stop { .. }
    ) {
        if let Err(e) = activity_log.activate(&paths.log_file()) {
            tracing::warn!("{e}");
        }
    }

    let lc = HostLifecycle::host(Context { paths, settings });

    match cli.command {
        Command::Init { .. } | Command::Show { .. } => unreachable!(),
        Command::Create(args) => create(&lc, args).await?,
        Command::Delete { name, all, yes } => {
            if all {
                if !yes && !confirm("Delete all instances?")? {
                    println!("Cancelled.");
                    return Ok(());
                }
                let deleted = lc.delete_all().await?;
                println!("Deleted {} instance(s).", deleted.len());
            } else if let Some(name) = name {
                lc.delete(&name).await?;
                println!("Deleted '{name}'.");
            }
        }
        Command::List { all } => print_list(&lc.list(all)?),
        Command::Start { name } => lc.start(&name).await?,
        Command::Stop { name } => lc.stop(&name).await?,
        Command::Address { name } => println!("{}", lc.address(&name).await?),
        Command::Login {
            name,
            sftp,
            command,
        } => {
            let mode = match (sftp, command) {
                (true, _) => LoginMode::Sftp,
                (false, Some(cmd)) => LoginMode::Command(cmd),
                (false, None) => LoginMode::Shell,
            };
            let code = lc.login(&name, &mode).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Run {
            name,
            sudo,
            command,
        } => {
            let command = shell_words::join(&command);
            let output = lc.run_command(&name, &command, sudo).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if output.code != 0 {
                std::process::exit(output.code);
            }
        }
        Command::Playbook { name, playbook } => lc.run_playbook(&name, &playbook).await?,
        Command::Inventory => {
            let path = lc.context().paths.inventory_file();
            let count = inventory::write_inventory(lc.store(), &path)?;
            println!("Wrote {count} host(s) to {}", path.display());
        }
    }

    Ok(())
}

async fn create(lc: &HostLifecycle, args: CreateArgs) -> Result<(), VirtupError> {
    if let Some(name) = &args.name {
        validate_name(name)?;
    }
    let template = args
        .template
        .clone()
        .or_else(|| lc.context().settings.site().template)
        .ok_or_else(|| VirtupError::Validation {
            message: "no template given; use --template or set `template` in [site]".into(),
        })?;
    // Fail before touching libvirt unless a recorded base makes the build a no-op.
    let base_name = template_instance_name(&args.prefix, &template);
    if !lc.store().exists(&base_name) {
        lc.context().settings.template(&template)?;
    }

    let base = lc
        .build(&BuildOptions {
            template,
            name: None,
            prefix: args.prefix.clone(),
            size: args.size.clone(),
            memory: args.memory,
            vcpus: args.vcpus,
            graphics: args.graphics.clone(),
            root_password: args.root_password.clone(),
            username: args.user.clone(),
            password: args.password.clone(),
            dns_domain: args.dns_domain.clone(),
            inventory: !args.no_inventory,
        })
        .await?;

    let Some(name) = args.name.filter(|_| !args.no_clone) else {
        println!("Template instance '{base}' is ready.");
        return Ok(());
    };

    if lc.exists(&name)? {
        lc.start(&name).await?;
    } else {
        lc.clone_instance(
            &base,
            &name,
            &CloneOptions {
                memory: args.memory,
                vcpus: args.vcpus,
                graphics: args.graphics,
                root_password: args.root_password,
                dns_domain: args.dns_domain,
                inventory: !args.no_inventory,
            },
        )
        .await?;
    }
    lc.wait_for_port(&name, 22).await?;
    tracing::info!(name = %name, "instance is up");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool, VirtupError> {
    match Confirm::new(prompt).with_default(false).prompt() {
        Ok(answer) => Ok(answer),
        Err(
            inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted,
        ) => Ok(false),
        Err(e) => Err(VirtupError::Validation {
            message: format!("prompt error: {e}"),
        }),
    }
}

fn print_list(instances: &[InstanceSummary]) {
    if instances.is_empty() {
        println!("No instances.");
        return;
    }
    let width = instances.iter().map(|i| i.name.len()).max().unwrap_or(0);
    for i in instances {
        let origin = if i.is_clone {
            format!("from {}", i.from.as_deref().unwrap_or("?"))
        } else {
            format!("template {}", i.template.as_deref().unwrap_or("?"))
        };
        println!(
            "  {:<width$}  {:<8}  {:<15}  {origin}",
            i.name,
            if i.active { "running" } else { "shut off" },
            i.address.as_deref().unwrap_or("-"),
        );
    }
}

fn show_paths(paths: &Paths) {
    println!("config:    {}", paths.config_home.display());
    println!("system:    {}", paths.system_config.display());
    println!("data:      {}", paths.data_home.display());
    println!("playbooks: {}", paths.playbooks_dir().display());
    println!("inventory: {}", paths.inventory_file().display());
    println!("log:       {}", paths.log_file().display());
}

fn show_templates(settings: &Settings) {
    let templates: Vec<_> = settings.templates().collect();
    let width = templates.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
    for (name, tmpl) in templates {
        println!(
            "  {:<width$}  {:<8}  {}",
            name,
            tmpl.arch.as_deref().unwrap_or("-"),
            tmpl.desc.as_deref().unwrap_or(""),
        );
    }
}
