// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.
use crate::stream::Color;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

fn default_user() -> String {
    "root".to_string()
}

fn default_hostname() -> String {
    "psdock".to_string()
}

fn default_env() -> Vec<String> {
    vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        "TERM=xterm".to_string(),
    ]
}

fn default_kill_timeout() -> i64 {
    -1
}

pub fn default_state_root() -> PathBuf {
    PathBuf::from("/var/run/psdock")
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no image specified")]
    MissingImage,
    #[error("no rootfs specified")]
    MissingRootfs,
    #[error("image {0:?} does not exist")]
    ImageNotFound(PathBuf),
    #[error("no command specified")]
    MissingCommand,
    #[error("invalid bind mount {0}")]
    InvalidBindMount(String),
    #[error("invalid bind mount mode {0}")]
    InvalidBindMountMode(String),
}

/// Everything needed to supervise one container run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Immutable image directory, used as the read only layer
    pub image: PathBuf,
    /// Writable rootfs presented to the process
    pub rootfs: PathBuf,
    pub command: Vec<String>,
    /// Standard input/output of the process, the host terminal if empty
    #[serde(default)]
    pub stdio: String,
    #[serde(default)]
    pub stdout_prefix: Option<Prefix>,
    /// URL notified with status changes of the process
    #[serde(default)]
    pub web_hook: Option<String>,
    /// Port the process is expected to bind before being considered running
    #[serde(default)]
    pub bind_port: Option<u16>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_env")]
    pub env: Vec<String>,
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
    /// Hours between log rotations, 0 disables rotation
    #[serde(default)]
    pub log_rotate: u64,
    /// Seconds to wait after forwarding an interrupt before killing the process, negative to wait
    /// forever
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: i64,
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
}

impl SupervisorConfig {
    pub fn new(image: impl Into<PathBuf>, rootfs: impl Into<PathBuf>, command: Vec<String>) -> Self {
        SupervisorConfig {
            image: image.into(),
            rootfs: rootfs.into(),
            command,
            stdio: String::new(),
            stdout_prefix: None,
            web_hook: None,
            bind_port: None,
            user: default_user(),
            cwd: None,
            hostname: default_hostname(),
            env: default_env(),
            bind_mounts: Vec::new(),
            log_rotate: 0,
            kill_timeout: default_kill_timeout(),
            state_root: default_state_root(),
        }
    }

    /// Sanity check performed before anything is mounted or spawned
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.as_os_str().is_empty() {
            return Err(ConfigError::MissingImage);
        }
        if self.rootfs.as_os_str().is_empty() {
            return Err(ConfigError::MissingRootfs);
        }
        if !self.image.is_dir() {
            return Err(ConfigError::ImageNotFound(self.image.clone()));
        }
        if self.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        Ok(())
    }

    pub fn web_hook(&self) -> Option<&str> {
        self.web_hook.as_deref().filter(|url| !url.is_empty())
    }
}

/// `source:destination[:ro|rw]`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub read_only: bool,
}

impl FromStr for BindMount {
    type Err = ConfigError;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts = input.splitn(3, ':').collect::<Vec<_>>();
        let read_only = match parts.as_slice() {
            [_, _] => false,
            [_, _, "ro"] => true,
            [_, _, "rw"] => false,
            [_, _, mode] => return Err(ConfigError::InvalidBindMountMode(mode.to_string())),
            _ => return Err(ConfigError::InvalidBindMount(input.to_string())),
        };
        if parts[0].is_empty() || parts[1].is_empty() {
            return Err(ConfigError::InvalidBindMount(input.to_string()));
        }
        Ok(BindMount {
            source: PathBuf::from(parts[0]),
            destination: PathBuf::from(parts[1]),
            read_only,
        })
    }
}

/// Decoration applied to every line of the process output: `prefix[:color]`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub prefix: String,
    pub color: Color,
}

impl FromStr for Prefix {
    type Err = std::convert::Infallible;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let components = input.split(':').collect::<Vec<_>>();
        if components.len() == 1 {
            Ok(Prefix {
                prefix: input.to_string(),
                color: Color::None,
            })
        } else {
            Ok(Prefix {
                prefix: components[0].to_string(),
                color: Color::from_token(components[components.len() - 1]),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_mount() {
        let mount = "/data:/var/data".parse::<BindMount>().unwrap();
        assert_eq!(mount.source, PathBuf::from("/data"));
        assert_eq!(mount.destination, PathBuf::from("/var/data"));
        assert!(!mount.read_only);

        let mount = "/data:/var/data:ro".parse::<BindMount>().unwrap();
        assert!(mount.read_only);

        let mount = "/data:/var/data:rw".parse::<BindMount>().unwrap();
        assert!(!mount.read_only);
    }

    #[test]
    fn test_parse_bind_mount_errors() {
        assert_eq!(
            "/data".parse::<BindMount>(),
            Err(ConfigError::InvalidBindMount("/data".to_string()))
        );
        assert_eq!(
            "/data:/var/data:rx".parse::<BindMount>(),
            Err(ConfigError::InvalidBindMountMode("rx".to_string()))
        );
        assert!(":/var/data".parse::<BindMount>().is_err());
    }

    #[test]
    fn test_parse_prefix() {
        let prefix = "web".parse::<Prefix>().unwrap();
        assert_eq!(prefix.prefix, "web");
        assert_eq!(prefix.color, Color::None);

        let prefix = "web:blue".parse::<Prefix>().unwrap();
        assert_eq!(prefix.prefix, "web");
        assert_eq!(prefix.color, Color::Blue);

        let prefix = "web:unknown".parse::<Prefix>().unwrap();
        assert_eq!(prefix.color, Color::None);
    }

    #[test]
    fn test_validate() {
        let config = SupervisorConfig::new("", "/tmp/rootfs", vec!["ls".to_string()]);
        assert_eq!(config.validate(), Err(ConfigError::MissingImage));

        let config = SupervisorConfig::new("/", "", vec!["ls".to_string()]);
        assert_eq!(config.validate(), Err(ConfigError::MissingRootfs));

        let config = SupervisorConfig::new("/", "/tmp/rootfs", Vec::new());
        assert_eq!(config.validate(), Err(ConfigError::MissingCommand));

        let config = SupervisorConfig::new("/", "/tmp/rootfs", vec!["ls".to_string()]);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: SupervisorConfig = serde_json::from_str(
            r#"{"image": "/images/ubuntu", "rootfs": "/tmp/rootfs", "command": ["ls"]}"#,
        )
        .unwrap();
        assert_eq!(config.user, "root");
        assert_eq!(config.hostname, "psdock");
        assert_eq!(config.kill_timeout, -1);
        assert_eq!(config.env.len(), 2);
        assert_eq!(config.state_root, PathBuf::from("/var/run/psdock"));
    }
}
