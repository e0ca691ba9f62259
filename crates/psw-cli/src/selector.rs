use clap::ValueEnum;
use psw_core::ProjectRecord;
use std::io::{self, Write};
use std::process::{Command, Stdio};

const DISPLAY_SEPARATOR: &str = " | ";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SelectorKind {
    Rofi,
    Fzf,
}

impl SelectorKind {
    fn command(self) -> Command {
        match self {
            SelectorKind::Rofi => {
                let mut cmd = Command::new("rofi");
                cmd.args(["-dmenu", "-i", "-p", "Project"]);
                cmd
            }
            SelectorKind::Fzf => {
                let mut cmd = Command::new("fzf");
                cmd.args(["--no-sort", "--prompt", "project> "]);
                cmd
            }
        }
    }

    fn program(self) -> &'static str {
        match self {
            SelectorKind::Rofi => "rofi",
            SelectorKind::Fzf => "fzf",
        }
    }
}

pub fn display_line(record: &ProjectRecord) -> String {
    let mut line = format!("{}{DISPLAY_SEPARATOR}ws {}", record.name, record.workspace);
    if !record.tags.is_empty() {
        line.push_str(DISPLAY_SEPARATOR);
        line.push_str(&record.tags.join(", "));
    }
    line
}

pub fn name_from_line(line: &str) -> Option<&str> {
    let name = match line.split_once(DISPLAY_SEPARATOR) {
        Some((name, _)) => name,
        None => line,
    };
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Hands `lines` to the external selector and returns the picked line.
/// Cancelling the selector yields `None`.
pub fn pick(kind: SelectorKind, lines: &[String]) -> io::Result<Option<String>> {
    let mut child = kind
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|err| io::Error::new(err.kind(), format!("{}: {err}", kind.program())))?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = lines.join("\n");
        // a selector that exits early closes the pipe; its exit status decides
        let _ = stdin.write_all(payload.as_bytes());
        let _ = stdin.write_all(b"\n");
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Ok(None);
    }
    let picked = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!picked.is_empty()).then_some(picked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(name: &str, tags: &[&str]) -> ProjectRecord {
        ProjectRecord {
            name: name.to_string(),
            workspace: "3".to_string(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            directory: PathBuf::from("/p"),
            config_path: PathBuf::from("/p/.project.nix"),
        }
    }

    #[test]
    fn display_line_round_trips_to_name() {
        let line = display_line(&record("web shop", &["rust", "api"]));
        assert_eq!(line, "web shop | ws 3 | rust, api");
        assert_eq!(name_from_line(&line), Some("web shop"));
    }

    #[test]
    fn untagged_projects_omit_tag_column() {
        assert_eq!(display_line(&record("cli", &[])), "cli | ws 3");
    }

    #[test]
    fn bare_names_and_blank_lines() {
        assert_eq!(name_from_line("typed-by-hand"), Some("typed-by-hand"));
        assert_eq!(name_from_line("   "), None);
    }
}
