use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VirtupError {
    // ── configuration ─────────────────────────────────────

    #[error("failed to load settings from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("template '{name}' not found in settings")]
    #[diagnostic(help("run `virt-up show templates` to list the available templates"))]
    TemplateNotFound { name: String },

    #[error("invalid instance name '{name}'")]
    #[diagnostic(help("names must match [a-zA-Z0-9][a-zA-Z0-9._-]*"))]
    InvalidName { name: String },

    #[error("invalid address source '{source_name}' for '{name}'")]
    #[diagnostic(help("use one of: agent, lease, arp, dns"))]
    InvalidAddressSource { name: String, source_name: String },

    // ── preconditions ─────────────────────────────────────

    #[error("instance '{name}' is inconsistent: {detail}")]
    #[diagnostic(help("manual cleanup is required (virsh undefine / remove the metadata file)"))]
    Inconsistent { name: String, detail: String },

    #[error("element '{field}' is missing in '{name}' metadata")]
    MissingLineage { name: String, field: String },

    #[error("missing ssh public key '{path}'")]
    #[diagnostic(help("remove the private key to have a new pair generated"))]
    MissingPublicKey { path: String },

    #[error("instance '{name}' not found")]
    NotFound { name: String },

    // ── resource conflicts ────────────────────────────────

    #[error("domain '{name}' without metadata already exists")]
    DomainExists { name: String },

    #[error("image file '{path}' already exists")]
    ImageExists { path: String },

    #[error("instance '{name}' is the base of linked clones: {}", clones.join(", "))]
    #[diagnostic(help("delete the clones first"))]
    HasDependents { name: String, clones: Vec<String> },

    #[error("read and write access is required for path '{path}'")]
    PermissionDenied { path: String },

    // ── retries exhausted ─────────────────────────────────

    #[error("timed out waiting for {what} of instance '{name}'")]
    Timeout { name: String, what: String },

    #[error("unable to find address for instance '{name}'")]
    AddressNotFound { name: String },

    // ── hypervisor ────────────────────────────────────────

    #[error("libvirt: {message}")]
    Libvirt {
        message: String,
        #[help]
        hint: String,
    },

    #[error("guest agent of '{name}' is not responding")]
    AgentUnresponsive { name: String },

    #[error("operation invalid for '{name}': {message}")]
    OperationInvalid { name: String, message: String },

    // ── external tools & storage ──────────────────────────

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    MetadataParse { path: String, message: String },

    #[error("failed to serialize {path}: {message}")]
    Serialize { path: String, message: String },

    #[error("ssh key error: {message}")]
    SshKey { message: String },
}
