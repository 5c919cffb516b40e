use std::path::Path;

/// How `login` connects to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMode {
    Shell,
    Sftp,
    Command(String),
}

/// Non-interactive ssh options shared by login, remote commands and the
/// inventory. Host keys change on every rebuild, so none are checked or kept.
pub fn common_options(control_dir: &Path) -> Vec<String> {
    let control_path = control_dir.join("%C");
    [
        "PasswordAuthentication=no".to_string(),
        "CheckHostIP=no".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "StrictHostKeyChecking=no".into(),
        "LogLevel=ERROR".into(),
        "ControlMaster=auto".into(),
        format!("ControlPath={}", control_path.display()),
        "ControlPersist=60".into(),
    ]
    .into_iter()
    .flat_map(|opt| ["-o".to_string(), opt])
    .collect()
}

/// Arguments for `ssh`, or `sftp` when `mode` is `Sftp`.
pub fn login_args(
    identity: &str,
    options: &[String],
    user: &str,
    address: &str,
    mode: &LoginMode,
) -> Vec<String> {
    let mut args = vec!["-i".to_string(), identity.to_string()];
    args.extend(options.iter().cloned());
    args.push(format!("{user}@{address}"));
    if let LoginMode::Command(command) = mode {
        args.push(command.clone());
    }
    args
}

pub fn program(mode: &LoginMode) -> &'static str {
    match mode {
        LoginMode::Sftp => "sftp",
        LoginMode::Shell | LoginMode::Command(_) => "ssh",
    }
}

/// Wrap `command` for execution through sudo on the guest.
pub fn sudo(command: &str) -> String {
    format!("sudo -n sh -c {}", shell_words::quote(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_disable_host_key_checks_and_multiplex() {
        let opts = common_options(Path::new("/data/ssh-control"));
        assert_eq!(opts.len(), 16);
        assert!(opts.chunks(2).all(|pair| pair[0] == "-o"));
        assert!(opts.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(opts.contains(&"ControlPath=/data/ssh-control/%C".to_string()));
    }

    #[test]
    fn command_goes_after_destination() {
        let args = login_args(
            "/keys/virt",
            &["-o".into(), "LogLevel=ERROR".into()],
            "virt",
            "10.0.0.5",
            &LoginMode::Command("uptime".into()),
        );
        assert_eq!(
            args,
            ["-i", "/keys/virt", "-o", "LogLevel=ERROR", "virt@10.0.0.5", "uptime"]
        );
    }

    #[test]
    fn sftp_uses_sftp_program() {
        assert_eq!(program(&LoginMode::Sftp), "sftp");
        assert_eq!(program(&LoginMode::Shell), "ssh");
    }

    #[test]
    fn sudo_quotes_command() {
        assert_eq!(sudo("echo hi"), "sudo -n sh -c 'echo hi'");
    }
}
