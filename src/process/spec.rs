use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How a host program is started. Arguments may use the placeholders
/// `{name}`, `{uri}`, `{channel}` and `{log}`. An argument that is exactly
/// `{params}` is replaced by the process's extra startup parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HostTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

const PARAMS: &str = "{params}";

impl Default for HostTemplate {
    fn default() -> Self {
        Self {
            program: "jalv".to_string(),
            args: vec!["-n".into(), "{name}".into(), PARAMS.into(), "{uri}".into()],
        }
    }
}

impl HostTemplate {
    /// Expand the placeholders for one process.
    ///
    /// Without a `{params}` argument the parameters go in front of the last
    /// argument naming `{uri}`, where option parsing still sees them, or at
    /// the end when no argument does.
    pub fn render_args(&self, spec: &ProcessSpec, channel: &Path, log: &Path) -> Vec<String> {
        let channel = channel.to_string_lossy();
        let log = log.to_string_lossy();
        let expand = |arg: &String| {
            arg.replace("{name}", &spec.name)
                .replace("{uri}", &spec.uri)
                .replace("{channel}", &channel)
                .replace("{log}", &log)
        };

        let slot = if self.args.iter().any(|a| a == PARAMS) {
            None
        } else {
            Some(
                self.args
                    .iter()
                    .rposition(|a| a.contains("{uri}"))
                    .unwrap_or(self.args.len()),
            )
        };

        let mut args = Vec::with_capacity(self.args.len() + spec.params.len());
        for (i, arg) in self.args.iter().enumerate() {
            if slot == Some(i) {
                args.extend(spec.params.iter().cloned());
            }
            if arg == PARAMS {
                args.extend(spec.params.iter().cloned());
            } else {
                args.push(expand(arg));
            }
        }
        if slot == Some(self.args.len()) {
            args.extend(spec.params.iter().cloned());
        }
        args
    }
}

/// What to launch under a given logical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Unique key; also the client name the host registers with the daemon.
    pub name: String,
    /// Plugin URI handed to the host.
    pub uri: String,
    /// Extra startup parameters, placed where the template asks for them.
    pub params: Vec<String>,
    pub host: HostTemplate,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, uri: impl Into<String>, host: HostTemplate) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            params: Vec::new(),
            host,
        }
    }

    pub fn with_params(mut self, params: Vec<String>) -> Self {
        self.params = params;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(template: &HostTemplate, spec: &ProcessSpec) -> Vec<String> {
        template.render_args(spec, Path::new("/tmp/r.ctl"), Path::new("/tmp/r.log"))
    }

    #[test]
    fn params_land_before_the_plugin_uri() {
        let spec = ProcessSpec::new("rig-reverb", "http://calf.sourceforge.net/plugins/Reverb", HostTemplate::default())
            .with_params(vec!["-b".into(), "1024".into()]);
        assert_eq!(
            render(&spec.host, &spec),
            vec!["-n", "rig-reverb", "-b", "1024", "http://calf.sourceforge.net/plugins/Reverb"]
        );

        let no_params = ProcessSpec::new("rig-gain", "urn:gain", HostTemplate::default());
        assert_eq!(render(&no_params.host, &no_params), vec!["-n", "rig-gain", "urn:gain"]);
    }

    #[test]
    fn templates_without_a_params_slot_still_get_them() {
        let spec = ProcessSpec::new("rig-reverb", "urn:reverb", HostTemplate::default())
            .with_params(vec!["-x".into()]);

        let uri_last = HostTemplate {
            program: "carla-single".into(),
            args: vec!["lv2".into(), "{uri}".into()],
        };
        assert_eq!(render(&uri_last, &spec), vec!["lv2", "-x", "urn:reverb"]);

        let no_uri = HostTemplate {
            program: "sh".into(),
            args: vec!["-c".into(), "exec cat".into(), "--pipe={channel}".into()],
        };
        assert_eq!(render(&no_uri, &spec), vec!["-c", "exec cat", "--pipe=/tmp/r.ctl", "-x"]);
    }
}
