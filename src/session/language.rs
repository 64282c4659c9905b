//! Supported languages and the commands used to build and run them.

use std::fmt;

use super::WORK_DIR;

/// Language of the code currently loaded in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Cpp,
    Python,
}

/// How the supervisor should start the tested program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    /// Run a compiled binary directly.
    Compiled { binary: String },
    /// Run a script through an interpreter.
    Interpreted { interpreter: String, script: String },
}

impl ExecCommand {
    pub fn argv(&self) -> Vec<&str> {
        match self {
            ExecCommand::Compiled { binary } => vec![binary.as_str()],
            ExecCommand::Interpreted {
                interpreter,
                script,
            } => vec![interpreter.as_str(), script.as_str()],
        }
    }

    /// Command line in the form the supervisor splits with shell rules.
    pub fn to_command_line(&self) -> String {
        shell_words::join(self.argv())
    }
}

impl Language {
    /// Maps a file extension (`.cpp`, `cpp`, `.py`, `py`) to a language.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.strip_prefix('.').unwrap_or(extension) {
            "cpp" => Some(Language::Cpp),
            "py" => Some(Language::Python),
            _ => None,
        }
    }

    /// Extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Python => "py",
        }
    }

    /// File name of the uploaded source inside [`WORK_DIR`].
    pub fn source_file_name(&self) -> String {
        format!("code.{}", self.extension())
    }

    pub fn source_path(&self) -> String {
        format!("{}/{}", WORK_DIR, self.source_file_name())
    }

    fn binary_path() -> String {
        format!("{}/code", WORK_DIR)
    }

    /// Compile step run once after upload, if the language needs one.
    pub fn compile_command(&self) -> Option<Vec<String>> {
        match self {
            Language::Cpp => Some(vec![
                "g++".to_string(),
                self.source_path(),
                "-o".to_string(),
                Self::binary_path(),
            ]),
            Language::Python => None,
        }
    }

    pub fn exec_command(&self) -> ExecCommand {
        match self {
            Language::Cpp => ExecCommand::Compiled {
                binary: Self::binary_path(),
            },
            Language::Python => ExecCommand::Interpreted {
                interpreter: "python".to_string(),
                script: self.source_path(),
            },
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Cpp => write!(f, "C++"),
            Language::Python => write!(f, "Python"),
        }
    }
}
