use super::{not_found, DatasetHandle, DatasetKind, PoolAdapter, PropertySource, PropertyValue};
use crate::error::{Result, ZsysError};
#[mockall_double::double]
use crate::sys::process::double as process_double;
use std::collections::HashMap;
use std::process::Command;
use std::str::FromStr;

/// Pool Adapter backed by the real `zfs` command line tool, parsing its
/// machine-readable `-H -p` tab separated output. No native pool library is
/// linked; this shells out the same way a human operator would.
pub struct ZfsPoolAdapter {
    zfs_bin: String,
}

impl Default for ZfsPoolAdapter {
    fn default() -> Self {
        Self {
            zfs_bin: "zfs".to_string(),
        }
    }
}

impl ZfsPoolAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(&self) -> Command {
        Command::new(&self.zfs_bin)
    }

    fn run(&self, mut command: Command) -> Result<String> {
        process_double::run_command_as_result(command.stdin(std::process::Stdio::null()))
            .map_err(ZsysError::PoolError)
    }

    /// Fetch every tracked property for every dataset in one `zfs get` call
    /// rather than one round trip per dataset per property.
    fn bulk_properties(&self) -> Result<HashMap<String, HashMap<String, PropertyValue>>> {
        let output = self.run({
            let mut command = self.command();
            command
                .args(&["get", "-H", "-p", "-t", "filesystem,snapshot", "-o", "name,property,value,source"])
                .arg(TRACKED_PROPERTIES.join(","));
            command
        })?;

        let mut by_dataset: HashMap<String, HashMap<String, PropertyValue>> = HashMap::new();
        for line in output.lines() {
            let mut fields = line.split('\t');
            let name = match fields.next() {
                Some(n) => n,
                None => continue,
            };
            let property = fields.next().unwrap_or_default();
            let value = fields.next().unwrap_or_default();
            let source = fields.next().unwrap_or_default();
            if value.is_empty() || value == "-" {
                continue;
            }
            let source = PropertySource::from_str(source).unwrap_or(PropertySource::Unknown);
            by_dataset
                .entry(name.to_string())
                .or_default()
                .insert(property.to_string(), PropertyValue::new(value, source));
        }
        Ok(by_dataset)
    }
}

/// Native + custom properties the graph needs decoded with their source on
/// every refresh.
const TRACKED_PROPERTIES: &[&str] = &[
    "mountpoint",
    "canmount",
    "com.ubuntu.zsys:bootfs",
    "com.ubuntu.zsys:last-used",
    "com.ubuntu.zsys:last-booted-kernel",
    "com.ubuntu.zsys:bootfs-datasets",
    "com.ubuntu.zsys:mountpoint",
    "com.ubuntu.zsys:canmount",
];

impl PoolAdapter for ZfsPoolAdapter {
    fn list(&self) -> Result<Vec<DatasetHandle>> {
        let output = self.run({
            let mut command = self.command();
            command.args(&[
                "list",
                "-H",
                "-p",
                "-t",
                "filesystem,snapshot",
                "-o",
                "name,type,origin",
            ]);
            command
        })?;

        let mut handles = Vec::new();
        for line in output.lines() {
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or_default().to_string();
            if name.is_empty() {
                continue;
            }
            let kind = match fields.next() {
                Some("snapshot") => DatasetKind::Snapshot,
                _ => DatasetKind::Filesystem,
            };
            let origin = match fields.next() {
                Some("-") | None | Some("") => None,
                Some(o) => Some(o.to_string()),
            };
            handles.push(DatasetHandle {
                name,
                kind,
                origin,
                properties: HashMap::new(),
            });
        }

        let properties = self.bulk_properties()?;
        for handle in &mut handles {
            if let Some(props) = properties.get(&handle.name) {
                handle.properties = props.clone();
            }
        }
        Ok(handles)
    }

    fn get_property(&self, dataset: &str, key: &str) -> Result<PropertyValue> {
        let output = self
            .run({
                let mut command = self.command();
                command
                    .args(&["get", "-H", "-p", "-o", "value,source"])
                    .arg(key)
                    .arg(dataset);
                command
            })
            .map_err(|_| not_found(dataset))?;

        let mut fields = output.trim_end().split('\t');
        let value = fields.next().unwrap_or_default().to_string();
        let source = fields
            .next()
            .and_then(|s| PropertySource::from_str(s).ok())
            .unwrap_or(PropertySource::Unknown);
        Ok(PropertyValue::new(value, source))
    }

    fn set_property(&self, dataset: &str, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(v) => self
                .run({
                    let mut command = self.command();
                    command.args(&["set"]).arg(format!("{}={}", key, v)).arg(dataset);
                    command
                })
                .map(|_| ()),
            None => self
                .run({
                    let mut command = self.command();
                    command.args(&["inherit", key]).arg(dataset);
                    command
                })
                .map(|_| ()),
        }
    }

    fn create_filesystem(&self, name: &str) -> Result<()> {
        self.run({
            let mut command = self.command();
            command.args(&["create", "-p"]).arg(name);
            command
        })
        .map(|_| ())
    }

    fn create_snapshot(&self, dataset: &str, snapshot_name: &str) -> Result<()> {
        self.run({
            let mut command = self.command();
            command.arg("snapshot").arg(format!("{}@{}", dataset, snapshot_name));
            command
        })
        .map(|_| ())
    }

    fn clone_snapshot(&self, snapshot: &str, target: &str) -> Result<()> {
        self.run({
            let mut command = self.command();
            command.args(&["clone", "-p"]).arg(snapshot).arg(target);
            command
        })
        .map(|_| ())
    }

    fn promote(&self, clone: &str) -> Result<()> {
        self.run({
            let mut command = self.command();
            command.arg("promote").arg(clone);
            command
        })
        .map(|_| ())
    }

    fn rename(&self, dataset: &str, new_name: &str) -> Result<()> {
        self.run({
            let mut command = self.command();
            command.arg("rename").arg(dataset).arg(new_name);
            command
        })
        .map(|_| ())
    }

    fn destroy(&self, dataset: &str) -> Result<()> {
        self.run({
            let mut command = self.command();
            command.arg("destroy").arg(dataset);
            command
        })
        .map(|_| ())
    }

    fn clones_of(&self, snapshot: &str) -> Result<Vec<String>> {
        let output = self.run({
            let mut command = self.command();
            command
                .args(&["list", "-H", "-p", "-t", "filesystem", "-o", "name,origin"]);
            command
        })?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let name = fields.next()?;
                let origin = fields.next()?;
                (origin == snapshot).then(|| name.to_string())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_property_source() {
        assert_eq!(PropertySource::from_str("local").unwrap(), PropertySource::Local);
        assert_eq!(PropertySource::from_str("-").unwrap(), PropertySource::Unknown);
    }
}
