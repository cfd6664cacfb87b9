//! Container runtime detection and container id extraction from cgroup
//! data.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

const CONTAINER_ID_LEN: usize = 64;
const SHORT_ID_LEN: usize = 12;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Container {
    Lxc,
    Docker,
    Crio,
    Containerd,
    Firejail,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Lxc => "lxc",
            Container::Docker => "docker",
            Container::Crio => "crio",
            Container::Containerd => "containerd",
            Container::Firejail => "firejail",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lxc" => Ok(Container::Lxc),
            "docker" => Ok(Container::Docker),
            "crio" => Ok(Container::Crio),
            "containerd" => Ok(Container::Containerd),
            "firejail" => Ok(Container::Firejail),
            _ => Err(format!("unknown container flavor {s}")),
        }
    }
}

impl Serialize for Container {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl Container {
    fn from_split_cgroup<S: AsRef<str>>(parts: &[S]) -> Option<Container> {
        if let Some(last) = parts.last() {
            let last = last.as_ref();
            if last.starts_with("docker-") {
                return Some(Container::Docker);
            }
            if last.starts_with("crio-") {
                return Some(Container::Crio);
            }
            if last.starts_with("cri-containerd-") {
                return Some(Container::Containerd);
            }
        }

        for part in parts {
            match part.as_ref() {
                "docker" => return Some(Container::Docker),
                p if p.starts_with("lxc.payload.") => return Some(Container::Lxc),
                _ => {}
            }
        }

        None
    }

    #[inline]
    pub fn from_cgroup(path: &str) -> Option<Container> {
        Self::from_split_cgroup(&path.split('/').collect::<Vec<_>>())
    }

    /// Guesses a container flavor from the executable paths of a task's
    /// ancestors.
    pub fn from_ancestors(ancestors: &[String]) -> Option<Container> {
        for a in ancestors {
            match a.as_str() {
                "/usr/bin/firejail" => return Some(Container::Firejail),
                "/usr/bin/containerd-shim-runc-v2" => return Some(Container::Docker),
                "/usr/bin/conmon" => return Some(Container::Crio),
                _ => {}
            };

            if a.starts_with("/snap/lxd/") && a.ends_with("/bin/lxd") {
                return Some(Container::Lxc);
            }
        }
        None
    }
}

/// Extracts the 12 character short container id from one cgroup line.
/// Handles both cgroup v1 `hierarchy:controller:path` and cgroup v2
/// `0::/path` lines, with either cgroupfs (`.../docker/<id>`) or systemd
/// (`.../docker-<id>.scope`) driver layouts.
pub fn extract_container_id(line: &str) -> Option<&str> {
    let path = line.rsplit(':').next().unwrap_or(line);

    for part in path.rsplit('/') {
        let part = part.strip_suffix(".scope").unwrap_or(part);
        let id = match part.rsplit_once('-') {
            Some((_, id)) => id,
            None => part,
        };
        if is_container_id(id) {
            return Some(&id[..SHORT_ID_LEN]);
        }
    }

    None
}

fn is_container_id(s: &str) -> bool {
    s.len() == CONTAINER_ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod test {
    use super::*;

    const ID: &str = "64d39c1d40a53521e1f0e5f4b5dbb0d155cba2b7ff7b03627168ef2b02435ea1";

    #[test]
    fn test_extract_container_id() {
        // cgroupfs driver, cgroup v1
        let line = format!("12:pids:/docker/{ID}");
        assert_eq!(extract_container_id(&line), Some("64d39c1d40a5"));

        // systemd driver, cgroup v2
        let line = format!("0::/system.slice/docker-{ID}.scope");
        assert_eq!(extract_container_id(&line), Some("64d39c1d40a5"));

        let line = format!("0::/kubepods.slice/kubepods-burstable.slice/crio-{ID}.scope");
        assert_eq!(extract_container_id(&line), Some("64d39c1d40a5"));

        let line = format!("0::/k8s.io/cri-containerd-{ID}");
        assert_eq!(extract_container_id(&line), Some("64d39c1d40a5"));
    }

    #[test]
    fn test_extract_container_id_host_lines() {
        assert_eq!(extract_container_id("0::/init.scope"), None);
        assert_eq!(extract_container_id("3:cpu:/user.slice/user-1000.slice"), None);
        // truncated ids are not container ids
        assert_eq!(extract_container_id("0::/docker/64d39c1d40a5"), None);
        assert_eq!(extract_container_id(""), None);
    }

    #[test]
    fn test_container_flavor_from_cgroup() {
        assert_eq!(
            Container::from_cgroup(&format!("/system.slice/docker-{ID}.scope")),
            Some(Container::Docker)
        );
        assert_eq!(
            Container::from_cgroup(&format!("/docker/{ID}")),
            Some(Container::Docker)
        );
        assert_eq!(
            Container::from_cgroup("/lxc.payload.mycontainer"),
            Some(Container::Lxc)
        );
        assert_eq!(Container::from_cgroup("/user.slice"), None);
    }

    #[test]
    fn test_container_serde() {
        assert_eq!(
            serde_json::to_string(&Container::Docker).unwrap(),
            r#""docker""#
        );
        assert_eq!("crio".parse::<Container>().unwrap(), Container::Crio);
        assert!("lxk".parse::<Container>().is_err());
    }
}
