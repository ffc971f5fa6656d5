//! Typed builders for the external commands the manager drives, and one
//! executor that runs them and classifies failures.
//!
//! Network commands run inside the host network namespace; composition
//! commands run wherever the composition tool finds its daemon.

use crate::Error;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};

/// Returns the name of the VLAN sub-interface for a vlan on a parent
/// interface. Kernel interface names are capped at 15 characters, so the
/// parent is truncated to 10 before the `.{vlan}` suffix.
pub fn vlan_ifname(interface: &str, vlan: u16) -> String {
    let parent: String = interface.chars().take(10).collect();
    format!("{}.{}", parent, vlan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanAction {
    Add,
    Del,
    Show,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeAction {
    AddIf,
    DelIf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeAction {
    Up,
    Stop,
    Down,
}

/// One external command invocation. Variants carry their parameters; a
/// single [`Cmd::run`] executes any of them.
#[derive(Debug, Clone)]
pub enum Cmd {
    /// `ip link set <if> [promisc on] up`
    LinkUp { interface: String, promisc: bool },

    /// `ip link add/del/show` for a VLAN sub-interface. Add implicitly
    /// brings the new sub-interface up afterwards.
    Vlan {
        action: VlanAction,
        interface: String,
        vlan: u16,
    },

    /// `brctl addif/delif <bridge> <if>`
    Bridge {
        action: BridgeAction,
        bridge: String,
        interface: String,
    },

    /// `docker-compose -p <project> -f <file>... (up -d | stop | down)`
    Compose {
        action: ComposeAction,
        project: String,
        files: Vec<PathBuf>,
    },
}

/// Prefix entering the host network namespace, where the veth endpoints,
/// VLAN sub-interfaces and bridges all live.
const HOST_NETNS: [&str; 4] = ["ip", "netns", "exec", "host"];

impl Cmd {
    pub fn link_up(interface: &str) -> Self {
        Cmd::LinkUp {
            interface: interface.to_owned(),
            promisc: true,
        }
    }

    pub fn vlan(action: VlanAction, interface: &str, vlan: u16) -> Self {
        Cmd::Vlan {
            action,
            interface: interface.to_owned(),
            vlan,
        }
    }

    pub fn bridge(action: BridgeAction, bridge: &str, interface: &str) -> Self {
        Cmd::Bridge {
            action,
            bridge: bridge.to_owned(),
            interface: interface.to_owned(),
        }
    }

    /// Builds a composition command. Relative composition file paths are
    /// resolved against the configured challenge folder.
    pub fn compose(
        action: ComposeAction,
        project: &str,
        files: &[String],
        challenge_folder: &Path,
    ) -> Self {
        Cmd::Compose {
            action,
            project: project.to_owned(),
            files: files.iter().map(|f| challenge_folder.join(f)).collect(),
        }
    }

    /// The full argument vector, program first.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            Cmd::LinkUp { interface, promisc } => {
                args.extend(HOST_NETNS.iter().map(|s| s.to_string()));
                args.extend(["ip", "link", "set"].map(String::from));
                args.push(interface.clone());
                if *promisc {
                    args.extend(["promisc", "on"].map(String::from));
                }
                args.push("up".to_owned());
            }
            Cmd::Vlan {
                action,
                interface,
                vlan,
            } => {
                args.extend(HOST_NETNS.iter().map(|s| s.to_string()));
                args.extend(["ip", "link"].map(String::from));
                match action {
                    VlanAction::Add => {
                        args.extend(["add", "link"].map(String::from));
                        args.push(interface.clone());
                        args.push("name".to_owned());
                        args.push(vlan_ifname(interface, *vlan));
                        args.extend(["type", "vlan", "id"].map(String::from));
                        args.push(vlan.to_string());
                    }
                    VlanAction::Del => {
                        args.push("del".to_owned());
                        args.push(vlan_ifname(interface, *vlan));
                    }
                    VlanAction::Show => {
                        args.push("show".to_owned());
                        args.push(vlan_ifname(interface, *vlan));
                    }
                }
            }
            Cmd::Bridge {
                action,
                bridge,
                interface,
            } => {
                args.extend(HOST_NETNS.iter().map(|s| s.to_string()));
                args.push("brctl".to_owned());
                args.push(
                    match action {
                        BridgeAction::AddIf => "addif",
                        BridgeAction::DelIf => "delif",
                    }
                    .to_owned(),
                );
                args.push(bridge.clone());
                args.push(interface.clone());
            }
            Cmd::Compose {
                action,
                project,
                files,
            } => {
                args.push("docker-compose".to_owned());
                args.push("-p".to_owned());
                args.push(project.clone());
                for file in files {
                    args.push("-f".to_owned());
                    args.push(file.to_string_lossy().into_owned());
                }
                match action {
                    ComposeAction::Up => args.extend(["up", "-d"].map(String::from)),
                    ComposeAction::Stop => args.push("stop".to_owned()),
                    ComposeAction::Down => args.push("down".to_owned()),
                }
            }
        }
        args
    }

    /// Runs the command to completion, capturing its output. Failure
    /// surfaces as [`Error::CommandFailed`] with the exit code and combined
    /// output attached.
    pub async fn run(&self) -> Result<(), Error> {
        let args = self.args();
        execute(&args).await?;
        // A freshly added VLAN sub-interface starts down.
        if let Cmd::Vlan {
            action: VlanAction::Add,
            interface,
            vlan,
        } = self
        {
            Cmd::link_up(&vlan_ifname(interface, *vlan)).run_inner().await?;
        }
        Ok(())
    }

    async fn run_inner(&self) -> Result<(), Error> {
        execute(&self.args()).await
    }
}

async fn execute(args: &[String]) -> Result<(), Error> {
    let command = args.join(" ");
    debug!("launching `{}`", command);
    let output = Command::new(&args[0]).args(&args[1..]).output().await?;
    if output.status.success() {
        return Ok(());
    }
    let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
    captured.push_str(&String::from_utf8_lossy(&output.stderr));
    let exit_code = output.status.code();
    if captured.trim().is_empty() {
        error!("`{}` failed with exit code {:?}", command, exit_code);
    } else {
        error!(
            "`{}` failed with exit code {:?}\n{}",
            command,
            exit_code,
            captured.trim_end()
        );
    }
    Err(Error::CommandFailed {
        command,
        exit_code,
        output: captured,
    })
}

/// Matcher for subprocess failures that callers know how to handle, e.g.
/// `ip link add` exiting 2 because the link already exists.
#[derive(Debug, Clone)]
pub struct ErrorMatch {
    code: Option<i32>,
    pattern: Option<Regex>,
}

impl ErrorMatch {
    /// Matches any command failure with the given exit code.
    pub fn code(code: i32) -> Self {
        ErrorMatch {
            code: Some(code),
            pattern: None,
        }
    }

    /// Matches any command failure whose captured output contains the
    /// pattern.
    pub fn output(pattern: &str) -> Self {
        ErrorMatch {
            code: None,
            pattern: Some(Regex::new(pattern).expect("invalid error match pattern")),
        }
    }

    /// Requires the captured output to contain the pattern in addition to
    /// any existing exit code requirement.
    pub fn with_output(mut self, pattern: &str) -> Self {
        self.pattern = Some(Regex::new(pattern).expect("invalid error match pattern"));
        self
    }

    /// True if `err` is a command failure meeting both the exit code and
    /// output requirements.
    pub fn matches(&self, err: &Error) -> bool {
        let (exit_code, output) = match err {
            Error::CommandFailed {
                exit_code, output, ..
            } => (exit_code, output),
            _ => return false,
        };
        if let Some(code) = self.code {
            if *exit_code != Some(code) {
                return false;
            }
        }
        match self.pattern.as_ref() {
            Some(pattern) => pattern.is_match(output),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_ifname_truncates_parent() {
        assert_eq!(vlan_ifname("veth0", 1234), "veth0.1234");
        // 15-char parent keeps the total within the kernel's limit
        let name = vlan_ifname("veth_listen_1_a", 4000);
        assert_eq!(name, "veth_liste.4000");
        assert!(name.len() <= 15);
    }

    #[test]
    fn test_link_up_args() {
        let args = Cmd::link_up("veth0").args();
        assert_eq!(
            args,
            [
                "ip", "netns", "exec", "host", "ip", "link", "set", "veth0", "promisc", "on", "up"
            ]
        );

        let plain = Cmd::LinkUp {
            interface: "veth0".to_owned(),
            promisc: false,
        };
        assert_eq!(
            plain.args(),
            ["ip", "netns", "exec", "host", "ip", "link", "set", "veth0", "up"]
        );
    }

    #[test]
    fn test_vlan_args() {
        let add = Cmd::vlan(VlanAction::Add, "veth0", 1234).args();
        assert_eq!(
            add,
            [
                "ip", "netns", "exec", "host", "ip", "link", "add", "link", "veth0", "name",
                "veth0.1234", "type", "vlan", "id", "1234"
            ]
        );

        let del = Cmd::vlan(VlanAction::Del, "veth0", 1234).args();
        assert_eq!(
            del,
            ["ip", "netns", "exec", "host", "ip", "link", "del", "veth0.1234"]
        );

        let show = Cmd::vlan(VlanAction::Show, "veth0", 1234).args();
        assert_eq!(
            show,
            ["ip", "netns", "exec", "host", "ip", "link", "show", "veth0.1234"]
        );
    }

    #[test]
    fn test_bridge_args() {
        let addif = Cmd::bridge(BridgeAction::AddIf, "br-0123456789ab", "veth0.1234").args();
        assert_eq!(
            addif,
            [
                "ip",
                "netns",
                "exec",
                "host",
                "brctl",
                "addif",
                "br-0123456789ab",
                "veth0.1234"
            ]
        );

        let delif = Cmd::bridge(BridgeAction::DelIf, "br-0123456789ab", "veth0.1234").args();
        assert_eq!(delif[5], "delif");
    }

    #[test]
    fn test_compose_args() {
        let files = vec!["listen/docker-compose.yml".to_owned()];
        let up = Cmd::compose(ComposeAction::Up, "alice@listen", &files, Path::new("/challenges"));
        assert_eq!(
            up.args(),
            [
                "docker-compose",
                "-p",
                "alice@listen",
                "-f",
                "/challenges/listen/docker-compose.yml",
                "up",
                "-d"
            ]
        );

        let stop = Cmd::compose(ComposeAction::Stop, "alice@listen", &files, Path::new("/challenges"));
        assert_eq!(*stop.args().last().unwrap(), "stop");

        let down = Cmd::compose(ComposeAction::Down, "alice@listen", &files, Path::new("/challenges"));
        assert_eq!(*down.args().last().unwrap(), "down");
    }

    fn command_failed(exit_code: Option<i32>, output: &str) -> Error {
        Error::CommandFailed {
            command: "true".to_owned(),
            exit_code,
            output: output.to_owned(),
        }
    }

    #[test]
    fn test_error_match_code() {
        let exists = ErrorMatch::code(2);
        assert!(exists.matches(&command_failed(Some(2), "RTNETLINK answers: File exists")));
        assert!(!exists.matches(&command_failed(Some(1), "")));
        assert!(!exists.matches(&command_failed(None, "")));
        assert!(!exists.matches(&Error::ConfigError("nope".to_owned())));
    }

    #[test]
    fn test_error_match_output() {
        let exists = ErrorMatch::output("File exists");
        assert!(exists.matches(&command_failed(Some(2), "RTNETLINK answers: File exists")));
        assert!(!exists.matches(&command_failed(Some(2), "Cannot find device")));
    }

    #[test]
    fn test_error_match_code_and_output() {
        let exists = ErrorMatch::code(2).with_output("File exists");
        assert!(exists.matches(&command_failed(Some(2), "RTNETLINK answers: File exists")));
        assert!(!exists.matches(&command_failed(Some(1), "RTNETLINK answers: File exists")));
        assert!(!exists.matches(&command_failed(Some(2), "Cannot find device")));
    }
}
