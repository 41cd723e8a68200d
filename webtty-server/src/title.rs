use crate::config::ConfigError;

/// Window title template with `{{var}}` placeholders.
///
/// Parsed once at boot so rendering cannot fail per session.
#[derive(Debug, Clone)]
pub struct TitleTemplate {
    parts: Vec<Part>,
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Var(Var),
}

#[derive(Debug, Clone, Copy)]
enum Var {
    Command,
    Hostname,
    RemoteAddr,
    Pid,
}

/// Per-session values substituted into the title.
#[derive(Debug, Clone)]
pub struct TitleVars {
    pub command: String,
    pub hostname: String,
    pub remote_addr: String,
    pub pid: i32,
}

impl TitleTemplate {
    pub fn parse(format: &str) -> Result<Self, ConfigError> {
        let mut parts = Vec::new();
        let mut rest = format;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| ConfigError::TitleFormat("unterminated placeholder".to_string()))?;
            let name = after[..close].trim();
            let var = match name {
                "command" => Var::Command,
                "hostname" => Var::Hostname,
                "remote_addr" => Var::RemoteAddr,
                "pid" => Var::Pid,
                other => {
                    return Err(ConfigError::TitleFormat(format!(
                        "unknown placeholder {other:?}"
                    )))
                }
            };
            parts.push(Part::Var(var));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn render(&self, vars: &TitleVars) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Var(Var::Command) => out.push_str(&vars.command),
                Part::Var(Var::Hostname) => out.push_str(&vars.hostname),
                Part::Var(Var::RemoteAddr) => out.push_str(&vars.remote_addr),
                Part::Var(Var::Pid) => out.push_str(&vars.pid.to_string()),
            }
        }
        out
    }
}
