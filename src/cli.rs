use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "virt-up",
    version,
    about = "Build, clone and track short-lived libvirt instances"
)]
pub struct Cli {
    /// Log debug output to the terminal
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub debug: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a template instance (if needed) and clone a new instance from it
    Create(CreateArgs),

    /// Delete an instance, or every instance with --all
    Delete {
        /// Instance name
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        name: Option<String>,

        /// Delete all instances, clones before templates
        #[arg(long)]
        all: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List instances (clones only unless --all)
    List {
        /// Include template instances
        #[arg(short, long)]
        all: bool,
    },

    /// Start an instance
    Start { name: String },

    /// Shut an instance down
    Stop { name: String },

    /// Print the address of an instance
    Address { name: String },

    /// Log in over ssh, or open sftp, or run one command
    Login {
        name: String,

        /// Open an sftp session instead of a shell
        #[arg(long, conflicts_with = "command")]
        sftp: bool,

        /// Run this command instead of an interactive shell
        #[arg(short, long)]
        command: Option<String>,
    },

    /// Run a command on an instance and print its output
    Run {
        name: String,

        /// Run through sudo
        #[arg(long)]
        sudo: bool,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Run an ansible playbook against an instance
    Playbook {
        name: String,

        /// Playbook file; relative names are also looked up in the playbooks directory
        playbook: PathBuf,
    },

    /// Regenerate the ansible inventory
    Inventory,

    /// Write default settings, helper scripts and playbooks
    Init {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Show configuration
    Show {
        #[command(subcommand)]
        what: ShowCommand,
    },
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Name of the new instance
    #[arg(required_unless_present = "no_clone")]
    pub name: Option<String>,

    /// Template to build from (default: the `template` site setting)
    #[arg(short, long)]
    pub template: Option<String>,

    /// Prefix for template instance names
    #[arg(long, default_value = "TEMPLATE-")]
    pub prefix: String,

    /// Only build the template instance
    #[arg(long)]
    pub no_clone: bool,

    /// Root password (default: random)
    #[arg(long)]
    pub root_password: Option<String>,

    /// Login user (default: the `username` site setting)
    #[arg(long)]
    pub user: Option<String>,

    /// Login user password (default: random)
    #[arg(long)]
    pub password: Option<String>,

    /// Disk size, e.g. 10G
    #[arg(long)]
    pub size: Option<String>,

    /// Memory in MiB
    #[arg(long)]
    pub memory: Option<u64>,

    /// Number of virtual CPUs
    #[arg(long)]
    pub vcpus: Option<u32>,

    /// Graphics type passed to virt-install
    #[arg(long)]
    pub graphics: Option<String>,

    /// DNS domain appended to the hostname
    #[arg(long)]
    pub dns_domain: Option<String>,

    /// Leave the instance out of the ansible inventory
    #[arg(long)]
    pub no_inventory: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum ShowCommand {
    /// Known templates
    Templates,
    /// Configuration and data locations
    Paths,
}
