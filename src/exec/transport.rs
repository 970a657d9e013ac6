//! Maps connection params onto a client invocation and reads its failures.

use std::ffi::OsString;

use crate::config::ExecConfig;
use crate::fs::expand_tilde;
use crate::resource::{AuthMethod, ConnectionParams};

use super::ExecError;

/// Exit status OpenSSH reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Which client carries the command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Transport {
    Ssh,
    Kubectl,
    Local,
}

/// A ready-to-spawn client invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct Invocation {
    pub(super) transport: Transport,
    pub(super) program: String,
    pub(super) args: Vec<OsString>,
}

/// Builds the client invocation for `command`.
///
/// # Errors
///
/// Returns [`ExecError::Unreachable`] when an SSH target has no address.
pub(super) fn invocation(
    config: &ExecConfig,
    params: &ConnectionParams,
    command: &str,
    interactive: bool,
) -> Result<Invocation, ExecError> {
    match &params.auth {
        AuthMethod::Ssh {
            user,
            identity_file,
        } => {
            let address = params.address.as_ref().ok_or_else(|| {
                ExecError::Unreachable(format!("machine {} has no address", params.machine_id))
            })?;
            let user = if user.trim().is_empty() {
                config.ssh_user.as_str()
            } else {
                user.as_str()
            };
            let mut args = vec![OsString::from("-p"), OsString::from(address.port.to_string())];
            if let Some(identity) = identity_file.as_ref().or(config.ssh_identity_file.as_ref()) {
                args.push(OsString::from("-i"));
                args.push(OsString::from(expand_tilde(identity)));
            }
            for option in [
                String::from("BatchMode=yes"),
                String::from("StrictHostKeyChecking=no"),
                String::from("LogLevel=ERROR"),
                format!("ConnectTimeout={}", config.dial_timeout_secs),
            ] {
                args.push(OsString::from("-o"));
                args.push(OsString::from(option));
            }
            if !interactive {
                args.push(OsString::from("-n"));
            }
            args.push(OsString::from(format!("{user}@{}", address.host)));
            args.push(OsString::from(command));
            Ok(Invocation {
                transport: Transport::Ssh,
                program: config.ssh_bin.clone(),
                args,
            })
        }
        AuthMethod::KubeExec {
            namespace,
            deployment,
            container,
            context,
        } => {
            let mut args = Vec::new();
            if let Some(context) = context {
                args.push(OsString::from("--context"));
                args.push(OsString::from(context));
            }
            args.extend([
                OsString::from("--namespace"),
                OsString::from(namespace),
                OsString::from("exec"),
            ]);
            if interactive {
                args.push(OsString::from("-i"));
            }
            args.extend([
                OsString::from(format!("deployment/{deployment}")),
                OsString::from("--container"),
                OsString::from(container),
                OsString::from("--"),
                OsString::from("sh"),
                OsString::from("-c"),
                OsString::from(command),
            ]);
            Ok(Invocation {
                transport: Transport::Kubectl,
                program: config.kubectl_bin.clone(),
                args,
            })
        }
        AuthMethod::Local => Ok(Invocation {
            transport: Transport::Local,
            program: String::from("sh"),
            args: vec![OsString::from("-c"), OsString::from(command)],
        }),
    }
}

/// Recognises client-side failures in a finished run.
///
/// Returns `None` when the exit status belongs to the remote command.
pub(super) fn classify_failure(
    transport: Transport,
    exit_code: Option<i32>,
    stderr: &[u8],
) -> Option<ExecError> {
    let text = String::from_utf8_lossy(stderr);
    let last_line = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_owned();
    match transport {
        Transport::Ssh if exit_code == Some(SSH_CLIENT_FAILURE) => {
            if text.contains("Permission denied") || text.contains("Too many authentication failures")
            {
                Some(ExecError::Authentication(last_line))
            } else if [
                "Connection refused",
                "Connection timed out",
                "No route to host",
                "Could not resolve hostname",
                "Connection closed by",
                "Network is unreachable",
            ]
            .iter()
            .any(|needle| text.contains(needle))
            {
                Some(ExecError::Unreachable(last_line))
            } else {
                None
            }
        }
        Transport::Kubectl if exit_code != Some(0) => {
            if text.contains("Unauthorized") || text.contains("Forbidden") {
                Some(ExecError::Authentication(last_line))
            } else if text.contains("Unable to connect to the server") {
                Some(ExecError::Unreachable(last_line))
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::resource::Address;
    use rstest::rstest;

    fn ssh_params(identity_file: Option<&str>) -> ConnectionParams {
        ConnectionParams {
            machine_id: String::from("srv-1"),
            address: Some(Address::new("203.0.113.5", 2222)),
            auth: AuthMethod::Ssh {
                user: String::from("ubuntu"),
                identity_file: identity_file.map(str::to_owned),
            },
            interactive: true,
        }
    }

    fn rendered(invocation: &Invocation) -> Vec<String> {
        invocation
            .args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ssh_batch_invocation_targets_user_and_port() {
        let invocation = invocation(
            &ExecConfig::default(),
            &ssh_params(Some("/keys/id")),
            "uname -a",
            false,
        )
        .expect("invocation");
        let args = rendered(&invocation);
        assert_eq!(invocation.program, "ssh");
        assert_eq!(args.get(..4), Some(&["-p", "2222", "-i", "/keys/id"].map(String::from)[..]));
        assert!(args.contains(&String::from("-n")));
        assert!(args.contains(&String::from("ConnectTimeout=10")));
        assert_eq!(
            args.get(args.len().saturating_sub(2)..),
            Some(&[String::from("ubuntu@203.0.113.5"), String::from("uname -a")][..])
        );
    }

    #[test]
    fn ssh_without_address_is_unreachable() {
        let mut params = ssh_params(None);
        params.address = None;
        let err = invocation(&ExecConfig::default(), &params, "true", true).expect_err("no address");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn kubectl_invocation_execs_into_deployment() {
        let params = ConnectionParams {
            machine_id: String::from("prevue-demo"),
            address: None,
            auth: AuthMethod::KubeExec {
                namespace: String::from("previews"),
                deployment: String::from("prevue-demo"),
                container: String::from("workspace"),
                context: Some(String::from("staging")),
            },
            interactive: true,
        };
        let invocation =
            invocation(&ExecConfig::default(), &params, "make test", true).expect("invocation");
        assert_eq!(invocation.transport, Transport::Kubectl);
        assert_eq!(rendered(&invocation), vec![
            "--context",
            "staging",
            "--namespace",
            "previews",
            "exec",
            "-i",
            "deployment/prevue-demo",
            "--container",
            "workspace",
            "--",
            "sh",
            "-c",
            "make test",
        ]);
    }

    #[rstest]
    #[case(Transport::Ssh, Some(255), "user@host: Permission denied (publickey).", Some(ErrorKind::Authentication))]
    #[case(Transport::Ssh, Some(255), "ssh: connect to host 10.0.0.1 port 22: Connection refused", Some(ErrorKind::Unreachable))]
    #[case(Transport::Ssh, Some(255), "remote script exited oddly", None)]
    #[case(Transport::Ssh, Some(1), "Permission denied", None)]
    #[case(Transport::Kubectl, Some(1), "error: You must be logged in to the server (Unauthorized)", Some(ErrorKind::Authentication))]
    #[case(Transport::Kubectl, Some(1), "Unable to connect to the server: dial tcp", Some(ErrorKind::Unreachable))]
    #[case(Transport::Local, Some(255), "Permission denied", None)]
    fn client_failures_are_classified(
        #[case] transport: Transport,
        #[case] exit_code: Option<i32>,
        #[case] stderr: &str,
        #[case] expected: Option<ErrorKind>,
    ) {
        let classified = classify_failure(transport, exit_code, stderr.as_bytes());
        assert_eq!(classified.as_ref().map(ExecError::kind), expected);
    }
}
