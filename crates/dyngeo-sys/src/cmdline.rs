//! Command line: `--frames N`, `--null`, `--validation`, `+set <name> <value>`
//! and `+at <frame> <name> <value>`.

/// A parameter assignment, optionally deferred to the start of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvarAssignment {
    pub frame: Option<u64>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub frames: u64,
    pub null_device: bool,
    pub validation: bool,
    pub assignments: Vec<CvarAssignment>,
}

impl Default for CommandLine {
    fn default() -> Self {
        Self { frames: 240, null_device: false, validation: false, assignments: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CmdlineError {
    #[error("{0} expects {1} argument(s)")]
    MissingArgument(&'static str, usize),
    #[error("{option}: \"{text}\" is not a number")]
    NotANumber { option: &'static str, text: String },
    #[error("unknown argument \"{0}\"")]
    Unknown(String),
}

impl CommandLine {
    /// Parse arguments, not including the program name.
    pub fn parse<I, S>(args: I) -> Result<Self, CmdlineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        let mut cmdline = CommandLine::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--frames" => {
                    let text = args.next().ok_or(CmdlineError::MissingArgument("--frames", 1))?;
                    cmdline.frames = parse_number("--frames", text)?;
                }
                "--null" => cmdline.null_device = true,
                "--validation" => cmdline.validation = true,
                "+set" => {
                    let (Some(name), Some(value)) = (args.next(), args.next()) else {
                        return Err(CmdlineError::MissingArgument("+set", 2));
                    };
                    cmdline.assignments.push(CvarAssignment { frame: None, name, value });
                }
                "+at" => {
                    let (Some(frame), Some(name), Some(value)) = (args.next(), args.next(), args.next()) else {
                        return Err(CmdlineError::MissingArgument("+at", 3));
                    };
                    let frame = parse_number("+at", frame)?;
                    cmdline.assignments.push(CvarAssignment { frame: Some(frame), name, value });
                }
                _ => return Err(CmdlineError::Unknown(arg)),
            }
        }
        Ok(cmdline)
    }

    /// Assignments applied before the first frame.
    pub fn initial_assignments(&self) -> impl Iterator<Item = &CvarAssignment> {
        self.assignments.iter().filter(|a| a.frame.is_none())
    }

    /// Assignments applied at the start of `frame`, in command line order.
    pub fn assignments_at(&self, frame: u64) -> impl Iterator<Item = &CvarAssignment> {
        self.assignments.iter().filter(move |a| a.frame == Some(frame))
    }
}

fn parse_number(option: &'static str, text: String) -> Result<u64, CmdlineError> {
    text.parse().map_err(|_| CmdlineError::NotANumber { option, text })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cmdline = CommandLine::parse(Vec::<String>::new()).unwrap();
        assert_eq!(cmdline, CommandLine::default());
    }

    #[test]
    fn test_full_command_line() {
        let cmdline = CommandLine::parse([
            "--frames",
            "10",
            "--null",
            "+set",
            "as_update_mode",
            "update",
            "+at",
            "5",
            "geo_sphere_blas",
            "4",
        ])
        .unwrap();
        assert_eq!(cmdline.frames, 10);
        assert!(cmdline.null_device);
        assert!(!cmdline.validation);

        let initial: Vec<_> = cmdline.initial_assignments().map(|a| a.name.as_str()).collect();
        assert_eq!(initial, ["as_update_mode"]);
        let at_five: Vec<_> = cmdline.assignments_at(5).map(|a| (a.name.as_str(), a.value.as_str())).collect();
        assert_eq!(at_five, [("geo_sphere_blas", "4")]);
        assert_eq!(cmdline.assignments_at(4).count(), 0);
    }

    #[test]
    fn test_errors() {
        assert_eq!(CommandLine::parse(["--frames"]), Err(CmdlineError::MissingArgument("--frames", 1)));
        assert_eq!(CommandLine::parse(["+set", "x"]), Err(CmdlineError::MissingArgument("+set", 2)));
        assert!(matches!(CommandLine::parse(["+at", "soon", "x", "1"]), Err(CmdlineError::NotANumber { .. })));
        assert_eq!(CommandLine::parse(["--fast"]), Err(CmdlineError::Unknown("--fast".into())));
    }
}
