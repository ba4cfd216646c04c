use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
};

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};

use crate::{
    command::HostCommand,
    error::ChainError,
    port::{Connection, PortRef},
    process::{HostTemplate, ProcessSpec},
};

/// A chain as written in a YAML chain file.
///
/// ```yaml
/// prefix: rig
/// processes:
///   - name: reverb
///     uri: http://calf.sourceforge.net/plugins/Reverb
///     controls: { dry: 0.8 }
/// connections:
///   - { from: "reverb:out_l", to: "system:playback_1" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChainFile {
    /// Namespace for client names; `reverb` becomes `<prefix>-reverb`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Default host command for every process.
    #[serde(default)]
    pub host: HostTemplate,
    pub processes: Vec<ProcessDecl>,
    #[serde(default)]
    pub connections: Vec<ConnectionDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ProcessDecl {
    pub name: String,
    pub uri: String,
    /// Extra startup parameters passed to the host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Preset loaded right after the ports are up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// Plugin state property to value, applied after the preset.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, String>,
    /// Parameter symbol to initial value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub controls: BTreeMap<String, f64>,
    /// Bypass switch, applied after the controls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<bool>,
    /// Raw commands, sent after everything else.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Ports of this process to wait for besides the wired ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConnectionDecl {
    pub from: PortRef,
    pub to: PortRef,
}

/// One process of a validated chain together with its initial commands.
#[derive(Debug, Clone)]
pub struct PlannedProcess {
    pub spec: ProcessSpec,
    pub commands: Vec<HostCommand>,
}

/// A validated chain with every name expanded to its client name.
#[derive(Debug, Clone, Default)]
pub struct ChainPlan {
    pub processes: Vec<PlannedProcess>,
    pub connections: Vec<Connection>,
    /// Ports the wiring stage depends on, deduplicated, declaration order.
    pub required_ports: Vec<PortRef>,
}

impl ChainPlan {
    /// Client names in launch order.
    pub fn names(&self) -> Vec<String> {
        self.processes.iter().map(|p| p.spec.name.clone()).collect()
    }
}

impl ChainFile {
    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let contents = fs::read_to_string(path).map_err(|e| ChainError::io(path, e))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ChainError> {
        serde_yaml_bw::from_str(contents)
            .map_err(|e| ChainError::InvalidChain(format!("YAML parse error: {e}")))
    }

    /// Pretty-printed JSON schema of the chain file format.
    pub fn schema_json() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&schema_for!(ChainFile))
    }

    pub fn client_name(&self, name: &str) -> String {
        match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}-{name}"),
            _ => name.to_string(),
        }
    }

    fn declared(&self) -> HashSet<&str> {
        self.processes.iter().map(|p| p.name.as_str()).collect()
    }

    /// Rewrite `port` onto the client name when its component is a declared
    /// process; foreign components such as `system` are left as they are.
    pub fn expand(&self, port: &PortRef) -> PortRef {
        if self.declared().contains(port.component.as_str()) {
            port.with_component(self.client_name(&port.component))
        } else {
            port.clone()
        }
    }

    /// Validate the file and resolve it into a [`ChainPlan`].
    pub fn plan(&self) -> Result<ChainPlan, ChainError> {
        if let Some(prefix) = &self.prefix {
            check_name("prefix", prefix)?;
        }
        if self.processes.is_empty() {
            return Err(ChainError::InvalidChain("chain declares no processes".into()));
        }

        let mut seen = HashSet::new();
        let mut plan = ChainPlan::default();
        let mut required = Vec::new();

        for decl in &self.processes {
            check_name("process name", &decl.name)?;
            if !seen.insert(decl.name.as_str()) {
                return Err(ChainError::InvalidChain(format!(
                    "process `{}` is declared twice",
                    decl.name
                )));
            }
            if decl.uri.trim().is_empty() {
                return Err(ChainError::InvalidChain(format!(
                    "process `{}` has an empty uri",
                    decl.name
                )));
            }

            let client = self.client_name(&decl.name);
            let commands = initial_commands(decl)?;
            for port in &decl.ready_ports {
                if port.trim().is_empty() || port.contains(['\n', '\r']) {
                    return Err(ChainError::InvalidChain(format!(
                        "process `{}` lists an invalid ready port `{}`",
                        decl.name,
                        port.escape_debug()
                    )));
                }
                required.push(PortRef::new(client.clone(), port.trim()));
            }

            let host = decl.host.clone().unwrap_or_else(|| self.host.clone());
            if host.program.trim().is_empty() {
                return Err(ChainError::InvalidChain(format!(
                    "process `{}` has no host program",
                    decl.name
                )));
            }
            plan.processes.push(PlannedProcess {
                spec: ProcessSpec::new(client, decl.uri.trim(), host).with_params(decl.args.clone()),
                commands,
            });
        }

        for decl in &self.connections {
            let connection = Connection::new(self.expand(&decl.from), self.expand(&decl.to));
            if connection.src == connection.dst {
                return Err(ChainError::InvalidChain(format!(
                    "connection `{connection}` loops onto itself"
                )));
            }
            required.push(connection.src.clone());
            required.push(connection.dst.clone());
            plan.connections.push(connection);
        }

        let mut unique = HashSet::new();
        plan.required_ports = required
            .into_iter()
            .filter(|p| unique.insert(p.clone()))
            .collect();
        Ok(plan)
    }
}

/// Preset first, then controls, then raw commands.
fn initial_commands(decl: &ProcessDecl) -> Result<Vec<HostCommand>, ChainError> {
    let mut commands = Vec::new();
    if let Some(preset) = &decl.preset {
        commands.push(HostCommand::LoadPreset(preset.trim().to_string()));
    }
    for (key, value) in &decl.state {
        commands.push(HostCommand::PatchSet {
            key: key.clone(),
            value: value.clone(),
        });
    }
    for (symbol, value) in &decl.controls {
        commands.push(HostCommand::SetParam {
            symbol: symbol.clone(),
            value: *value,
        });
    }
    if let Some(on) = decl.bypass {
        commands.push(HostCommand::Bypass(on));
    }
    for raw in &decl.commands {
        commands.push(HostCommand::Raw(raw.clone()));
    }
    for command in &commands {
        command
            .render()
            .map_err(|e| ChainError::InvalidChain(format!("process `{}`: {e}", decl.name)))?;
    }
    Ok(commands)
}

/// Names end up in file names and port references.
fn check_name(what: &str, name: &str) -> Result<(), ChainError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ':' | '/' | '\\'));
    if bad {
        return Err(ChainError::InvalidChain(format!(
            "{what} `{}` must be non-empty and free of whitespace, `:` and `/`",
            name.escape_debug()
        )));
    }
    Ok(())
}
