//! Host session proxy.
//!
//! The host session sits at a fixed path and controls processes on the
//! server's machine: enumerate, spawn, attach, resume and kill.

use serde::de::IgnoredAny;
use serde_json::json;
use tracing::{debug, instrument};

use crate::agent::SessionId;
use crate::bus::{reply_arg, BusConnection};
use crate::config::Interfaces;
use crate::error::Result;
use crate::transport::Body;
use crate::variant::VariantDict;

/// A running process on the server's machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// An installed application, as reported on mobile targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub identifier: String,
    pub name: String,
    /// `None` when the application is not running.
    pub pid: Option<u32>,
}

/// What to connect a spawned process's standard streams to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stdio {
    #[default]
    Inherit = 0,
    Pipe = 1,
}

/// Options for `Spawn`.
///
/// Sent as the positional tuple `(has_argv, argv, has_envp, envp, has_env,
/// env, cwd, stdio, aux)`; unset lists travel as `false, []`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnOptions {
    /// Full argument vector, including `argv[0]`.
    pub argv: Option<Vec<String>>,
    /// Replacement environment (`KEY=VALUE`).
    pub envp: Option<Vec<String>>,
    /// Additional environment (`KEY=VALUE`) on top of the server's.
    pub env: Option<Vec<String>>,
    pub cwd: Option<String>,
    pub stdio: Stdio,
    pub aux: VariantDict,
}

impl SpawnOptions {
    fn to_wire(&self) -> Result<serde_json::Value> {
        Ok(json!([
            self.argv.is_some(),
            self.argv.as_deref().unwrap_or_default(),
            self.envp.is_some(),
            self.envp.as_deref().unwrap_or_default(),
            self.env.is_some(),
            self.env.as_deref().unwrap_or_default(),
            self.cwd.as_deref().unwrap_or_default(),
            self.stdio as u32,
            serde_json::to_value(&self.aux)?,
        ]))
    }
}

/// Typed view of the remote host session interface.
#[derive(Clone)]
pub struct HostSession {
    bus: BusConnection,
    interface: String,
}

impl HostSession {
    pub fn new(bus: BusConnection, interfaces: &Interfaces) -> Self {
        Self {
            bus,
            interface: interfaces.host_session(),
        }
    }

    async fn call(&self, method: &str, args: Body) -> Result<Body> {
        self.bus
            .call(Interfaces::HOST_SESSION_PATH, &self.interface, method, args)
            .await
    }

    /// Server identity, architecture, platform and access level.
    pub async fn query_system_parameters(&self) -> Result<VariantDict> {
        let reply = self.call("QuerySystemParameters", Body::new()).await?;
        reply_arg("QuerySystemParameters", &reply, 0)
    }

    pub async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        let reply = self.call("EnumerateProcesses", vec![json!([])]).await?;
        let rows: Vec<(u32, String, IgnoredAny)> = reply_arg("EnumerateProcesses", &reply, 0)?;
        Ok(rows
            .into_iter()
            .map(|(pid, name, _)| ProcessInfo { pid, name })
            .collect())
    }

    pub async fn enumerate_applications(&self) -> Result<Vec<ApplicationInfo>> {
        let reply = self.call("EnumerateApplications", vec![json!([])]).await?;
        let rows: Vec<(String, String, u32, IgnoredAny)> =
            reply_arg("EnumerateApplications", &reply, 0)?;
        Ok(rows
            .into_iter()
            .map(|(identifier, name, pid, _)| ApplicationInfo {
                identifier,
                name,
                pid: (pid != 0).then_some(pid),
            })
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn attach(&self, pid: u32) -> Result<SessionId> {
        let reply = self.call("Attach", vec![json!(pid), json!([])]).await?;
        let id: SessionId = reply_arg("Attach", &reply, 0)?;
        debug!(session = %id, "Attached");
        Ok(id)
    }

    /// Start `program` suspended before its entry point; returns its pid.
    #[instrument(skip(self, options))]
    pub async fn spawn(&self, program: &str, options: &SpawnOptions) -> Result<u32> {
        let reply = self
            .call("Spawn", vec![json!(program), options.to_wire()?])
            .await?;
        let pid = reply_arg("Spawn", &reply, 0)?;
        debug!(pid, "Spawned");
        Ok(pid)
    }

    pub async fn resume(&self, pid: u32) -> Result<()> {
        self.call("Resume", vec![json!(pid)]).await?;
        Ok(())
    }

    pub async fn kill(&self, pid: u32) -> Result<()> {
        self.call("Kill", vec![json!(pid)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::connected;
    use crate::error::{Error, RemoteErrorKind};
    use crate::transport::Frame;

    #[test]
    fn spawn_options_wire_tuple() {
        let options = SpawnOptions {
            argv: Some(vec!["/bin/serve".into(), "a".into()]),
            cwd: Some("/tmp".into()),
            ..SpawnOptions::default()
        };
        assert_eq!(
            options.to_wire().unwrap(),
            json!([true, ["/bin/serve", "a"], false, [], false, [], "/tmp", 0, []])
        );
    }

    #[tokio::test]
    async fn applications_map_zero_pid_to_none() {
        let (bus, mut server) = connected();
        let host = HostSession::new(bus, &Interfaces::default());

        let call = tokio::spawn(async move { host.enumerate_applications().await });
        let (serial, member, _) = server.expect_call().await;
        assert_eq!(member, "EnumerateApplications");
        server
            .reply(
                serial,
                vec![json!([
                    ["com.example.app", "Example", 0, []],
                    ["com.example.live", "Live", 321, []]
                ])],
            )
            .await;

        let apps = call.await.unwrap().unwrap();
        assert_eq!(apps[0].pid, None);
        assert_eq!(apps[1].pid, Some(321));
    }

    #[tokio::test]
    async fn enumerate_processes_ignores_parameters() {
        let (bus, mut server) = connected();
        let host = HostSession::new(bus, &Interfaces::default());

        let call = tokio::spawn(async move { host.enumerate_processes().await });
        let (serial, _, body) = server.expect_call().await;
        assert_eq!(body, vec![json!([])]);
        server
            .reply(
                serial,
                vec![json!([
                    [1, "init", []],
                    [4242, "node", [["ppid", {"signature": "u", "value": 1}]]]
                ])],
            )
            .await;

        let processes = call.await.unwrap().unwrap();
        assert_eq!(
            processes,
            vec![
                ProcessInfo { pid: 1, name: "init".into() },
                ProcessInfo { pid: 4242, name: "node".into() },
            ]
        );
    }

    #[tokio::test]
    async fn kill_unknown_pid_is_not_found() {
        let (bus, mut server) = connected();
        let host = HostSession::new(bus, &Interfaces::default());

        let call = tokio::spawn(async move { host.kill(99999).await });
        let (serial, member, _) = server.expect_call().await;
        assert_eq!(member, "Kill");
        server
            .send(Frame::Error {
                reply_serial: serial,
                name: "re.frida.Error.ProcessNotFound".into(),
                message: "Unable to find process with pid 99999".into(),
            })
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err.as_remote().map(crate::error::RemoteCallError::kind),
            Some(RemoteErrorKind::ProcessNotFound)
        );
    }

    #[tokio::test]
    async fn malformed_attach_reply_is_invalid_reply() {
        let (bus, mut server) = connected();
        let host = HostSession::new(bus, &Interfaces::default());

        let call = tokio::spawn(async move { host.attach(10).await });
        let (serial, _, _) = server.expect_call().await;
        server.reply(serial, vec![json!(12)]).await;

        assert!(matches!(
            call.await.unwrap(),
            Err(Error::InvalidReply { .. })
        ));
    }
}
