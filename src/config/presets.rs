/// Interpreter launch templates.
///
/// The interpreter tag is a closed set. Each tag maps to exactly one fixed
/// binary and a fixed set of leading flags; nothing about the exec line is
/// taken from the job except the entrypoint and its arguments.
use serde::{Deserialize, Serialize};

/// Supported interpreters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    Python3,
    /// Accepted as an alias; launches the same binary as `Python3`
    Python,
    Node,
    Bash,
    Sh,
}

/// Runtime configuration for one interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    /// Absolute path of the interpreter inside the sandbox root
    pub executable: &'static str,
    /// Arguments placed before the entrypoint
    pub leading_args: &'static [&'static str],
    /// Extra environment the runtime needs to behave inside the sandbox
    pub env: &'static [(&'static str, &'static str)],
}

const PYTHON3: LaunchTemplate = LaunchTemplate {
    executable: "/usr/bin/python3",
    // -B: no .pyc writes, -u: unbuffered so truncation boundaries are exact
    leading_args: &["-B", "-u"],
    env: &[("PYTHONDONTWRITEBYTECODE", "1"), ("PYTHONUNBUFFERED", "1")],
};

const NODE: LaunchTemplate = LaunchTemplate {
    executable: "/usr/bin/node",
    leading_args: &[],
    env: &[("NODE_OPTIONS", "--max-old-space-size=256")],
};

const BASH: LaunchTemplate = LaunchTemplate {
    executable: "/bin/bash",
    leading_args: &["--noprofile", "--norc"],
    env: &[],
};

const SH: LaunchTemplate = LaunchTemplate {
    executable: "/bin/sh",
    leading_args: &[],
    env: &[],
};

impl Interpreter {
    pub const ALL: [Interpreter; 5] = [
        Interpreter::Python3,
        Interpreter::Python,
        Interpreter::Node,
        Interpreter::Bash,
        Interpreter::Sh,
    ];

    /// Parse a manifest tag. Unknown tags are a validation failure.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "python3" => Some(Interpreter::Python3),
            "python" => Some(Interpreter::Python),
            "node" => Some(Interpreter::Node),
            "bash" => Some(Interpreter::Bash),
            "sh" => Some(Interpreter::Sh),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Interpreter::Python3 => "python3",
            Interpreter::Python => "python",
            Interpreter::Node => "node",
            Interpreter::Bash => "bash",
            Interpreter::Sh => "sh",
        }
    }

    pub fn template(self) -> &'static LaunchTemplate {
        match self {
            Interpreter::Python3 | Interpreter::Python => &PYTHON3,
            Interpreter::Node => &NODE,
            Interpreter::Bash => &BASH,
            Interpreter::Sh => &SH,
        }
    }

    /// Full argv for running `entrypoint` with `args`.
    pub fn argv(self, entrypoint: &str, args: &[String]) -> Vec<String> {
        let template = self.template();
        let mut argv = Vec::with_capacity(2 + template.leading_args.len() + args.len());
        argv.push(template.executable.to_string());
        argv.extend(template.leading_args.iter().map(|a| a.to_string()));
        argv.push(entrypoint.to_string());
        argv.extend(args.iter().cloned());
        argv
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for interp in Interpreter::ALL {
            assert_eq!(Interpreter::from_tag(interp.tag()), Some(interp));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(Interpreter::from_tag("ruby"), None);
        assert_eq!(Interpreter::from_tag("/usr/bin/python3"), None);
        assert_eq!(Interpreter::from_tag("PYTHON3"), None);
    }

    #[test]
    fn python_alias_shares_template() {
        assert_eq!(
            Interpreter::Python.template(),
            Interpreter::Python3.template()
        );
    }

    #[test]
    fn argv_places_entrypoint_after_fixed_flags() {
        let argv = Interpreter::Python3.argv("main.py", &["--n".into(), "3".into()]);
        assert_eq!(argv, vec!["/usr/bin/python3", "-B", "-u", "main.py", "--n", "3"]);

        let argv = Interpreter::Sh.argv("run.sh", &[]);
        assert_eq!(argv, vec!["/bin/sh", "run.sh"]);
    }
}
