//! Identity resolution for post-deploy commands

use std::os::unix::fs::MetadataExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::{Uid, User};

use crate::errors::DeployError;

/// Account a command is re-executed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl From<User> for RunIdentity {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }
    }
}

impl RunIdentity {
    /// The explicit `run_as` account if given, otherwise the owner of `source`.
    /// Never falls back to the daemon's own identity.
    pub fn resolve(source: &Path, run_as: Option<&str>) -> Result<Self, DeployError> {
        match run_as {
            Some(name) => User::from_name(name)
                .map_err(|e| {
                    DeployError::InfrastructureError(format!("cannot look up user {}: {}", name, e))
                })?
                .map(Self::from)
                .ok_or_else(|| {
                    DeployError::InfrastructureError(format!("user {} does not exist", name))
                }),
            None => {
                let uid = std::fs::metadata(source)
                    .map_err(|e| {
                        DeployError::InfrastructureError(format!(
                            "cannot stat {}: {}",
                            source.display(),
                            e
                        ))
                    })?
                    .uid();
                User::from_uid(Uid::from_raw(uid))
                    .map_err(|e| {
                        DeployError::InfrastructureError(format!("cannot look up uid {}: {}", uid, e))
                    })?
                    .map(Self::from)
                    .ok_or_else(|| {
                        DeployError::InfrastructureError(format!(
                            "owner uid {} of {} has no account",
                            uid,
                            source.display()
                        ))
                    })
            }
        }
    }

    /// Switch the child to this identity with a matching login environment
    pub fn apply(&self, cmd: &mut Command) {
        cmd.uid(self.uid)
            .gid(self.gid)
            .env("HOME", &self.home)
            .env("USER", &self.name)
            .env("LOGNAME", &self.name);
    }
}
