//! Declarative build file parsing.
//!
//! One instruction per logical line; `#` starts a comment line and a trailing
//! `\` joins the next physical line. Keywords are case-insensitive.

use dockhand_models::DockhandError;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrypointForm {
    /// `["python", "app.py"]`
    Exec(Vec<String>),
    /// `python app.py`, wrapped in the configured shell at planning time.
    Shell(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From(String),
    Env(Vec<(String, String)>),
    Workdir(String),
    Copy {
        sources: Vec<String>,
        destination: String,
    },
    Run(String),
    Expose(String),
    Entrypoint(EntrypointForm),
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From(_) => "FROM",
            Instruction::Env(_) => "ENV",
            Instruction::Workdir(_) => "WORKDIR",
            Instruction::Copy { .. } => "COPY",
            Instruction::Run(_) => "RUN",
            Instruction::Expose(_) => "EXPOSE",
            Instruction::Entrypoint(_) => "ENTRYPOINT",
        }
    }

    /// Stable textual form used in cache keys.
    pub fn canonical(&self) -> String {
        match self {
            Instruction::From(r) => format!("FROM {r}"),
            Instruction::Env(pairs) => {
                let pairs: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={}", quote(v)))
                    .collect();
                format!("ENV {}", pairs.join(" "))
            }
            Instruction::Workdir(p) => format!("WORKDIR {p}"),
            Instruction::Copy {
                sources,
                destination,
            } => {
                let mut all = sources.clone();
                all.push(destination.clone());
                format!("COPY {}", json_array(&all))
            }
            Instruction::Run(cmd) => format!("RUN {cmd}"),
            Instruction::Expose(p) => format!("EXPOSE {p}"),
            Instruction::Entrypoint(EntrypointForm::Exec(args)) => {
                format!("ENTRYPOINT {}", json_array(args))
            }
            Instruction::Entrypoint(EntrypointForm::Shell(cmd)) => format!("ENTRYPOINT {cmd}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// 1-based line where the instruction starts.
    pub line: usize,
    pub instruction: Instruction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFile {
    pub steps: Vec<Step>,
}

impl BuildFile {
    pub fn load(path: &Path) -> Result<Self, DockhandError> {
        let content = std::fs::read_to_string(path).map_err(|e| DockhandError::Parse {
            line: 0,
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::parse(&content)
    }

    pub fn parse(source: &str) -> Result<Self, DockhandError> {
        let mut steps = Vec::new();

        for (line, text) in logical_lines(source)? {
            let (keyword, rest) = match text.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (text.as_str(), ""),
            };
            let err = |reason: String| DockhandError::Parse { line, reason };

            if rest.is_empty() {
                return Err(err(format!("{} requires arguments", keyword.to_uppercase())));
            }

            let instruction = match keyword.to_ascii_uppercase().as_str() {
                "FROM" => {
                    let words = split_words(rest).map_err(err)?;
                    if words.len() != 1 {
                        return Err(DockhandError::Parse {
                            line,
                            reason: "FROM takes exactly one base reference".to_string(),
                        });
                    }
                    Instruction::From(words[0].clone())
                }
                "ENV" => Instruction::Env(parse_env(rest).map_err(err)?),
                "WORKDIR" => Instruction::Workdir(rest.to_string()),
                "COPY" => {
                    let words = if rest.starts_with('[') {
                        parse_json_array(rest).map_err(err)?
                    } else {
                        split_words(rest).map_err(err)?
                    };
                    if let Some(flag) = words.iter().find(|w| w.starts_with("--")) {
                        return Err(DockhandError::Parse {
                            line,
                            reason: format!("COPY flag {flag} is not supported"),
                        });
                    }
                    if words.len() < 2 {
                        return Err(DockhandError::Parse {
                            line,
                            reason: "COPY requires at least one source and a destination"
                                .to_string(),
                        });
                    }
                    let mut sources = words;
                    let destination = sources.pop().unwrap_or_default();
                    Instruction::Copy {
                        sources,
                        destination,
                    }
                }
                "RUN" => Instruction::Run(rest.to_string()),
                "EXPOSE" => {
                    let words = split_words(rest).map_err(err)?;
                    if words.len() != 1 {
                        return Err(DockhandError::Parse {
                            line,
                            reason: "EXPOSE declares exactly one port".to_string(),
                        });
                    }
                    Instruction::Expose(words[0].clone())
                }
                "ENTRYPOINT" | "CMD" => {
                    if rest.starts_with('[') {
                        Instruction::Entrypoint(EntrypointForm::Exec(
                            parse_json_array(rest).map_err(err)?,
                        ))
                    } else {
                        Instruction::Entrypoint(EntrypointForm::Shell(rest.to_string()))
                    }
                }
                other => {
                    return Err(DockhandError::Parse {
                        line,
                        reason: format!("unknown instruction {other}"),
                    })
                }
            };

            steps.push(Step { line, instruction });
        }

        if steps.is_empty() {
            return Err(DockhandError::Parse {
                line: 0,
                reason: "build file contains no instructions".to_string(),
            });
        }

        Ok(Self { steps })
    }
}

/// Joins continuation lines and drops comments and blanks.
fn logical_lines(source: &str) -> Result<Vec<(usize, String)>, DockhandError> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in source.lines().enumerate() {
        let number = idx + 1;
        let trimmed = raw.trim();

        if trimmed.starts_with('#') {
            continue;
        }
        if trimmed.is_empty() && pending.is_none() {
            continue;
        }

        let (content, continues) = match trimmed.strip_suffix('\\') {
            Some(head) => (head.trim_end(), true),
            None => (trimmed, false),
        };

        let (start, mut text) = pending.take().unwrap_or((number, String::new()));
        if !text.is_empty() && !content.is_empty() {
            text.push(' ');
        }
        text.push_str(content);

        if continues {
            pending = Some((start, text));
        } else if !text.is_empty() {
            lines.push((start, text));
        }
    }

    if let Some((line, _)) = pending {
        return Err(DockhandError::Parse {
            line,
            reason: "line continuation at end of file".to_string(),
        });
    }

    Ok(lines)
}

/// Splits on whitespace, honouring double quotes and backslash escapes.
pub(crate) fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_quotes = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let next = chars.next().ok_or("dangling escape")?;
                current.push(next);
                in_word = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                in_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn parse_env(rest: &str) -> Result<Vec<(String, String)>, String> {
    let first = rest.split_whitespace().next().unwrap_or_default();

    let pairs = if first.contains('=') {
        split_words(rest)?
            .into_iter()
            .map(|word| match word.split_once('=') {
                Some((k, v)) => Ok((k.to_string(), v.to_string())),
                None => Err(format!("expected KEY=value, found {word:?}")),
            })
            .collect::<Result<Vec<_>, _>>()?
    } else {
        // Legacy `ENV KEY value with spaces` form.
        let (key, value) = rest
            .split_once(char::is_whitespace)
            .ok_or("ENV requires a value")?;
        vec![(key.to_string(), value.trim().to_string())]
    };

    for (key, _) in &pairs {
        let valid = key
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(format!("invalid variable name {key:?}"));
        }
    }
    Ok(pairs)
}

fn parse_json_array(input: &str) -> Result<Vec<String>, String> {
    serde_json::from_str::<Vec<String>>(input).map_err(|e| format!("invalid JSON array: {e}"))
}

fn json_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_default()
}

fn quote(value: &str) -> String {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("{value:?}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# service image
FROM python:3.11.9-slim-bookworm
ENV APP_HOME=/app
WORKDIR $APP_HOME

COPY requirements.txt requirements.lock ./
RUN python -m compileall \
    -q .
COPY . .
EXPOSE 5000
CMD ["python", "app.py"]
"#;

    #[test]
    fn test_parse_sample() {
        let file = BuildFile::parse(SAMPLE).unwrap();
        let keywords: Vec<&str> = file.steps.iter().map(|s| s.instruction.keyword()).collect();
        assert_eq!(
            keywords,
            vec!["FROM", "ENV", "WORKDIR", "COPY", "RUN", "COPY", "EXPOSE", "ENTRYPOINT"]
        );
        assert_eq!(file.steps[0].line, 3);
        assert_eq!(
            file.steps[4].instruction,
            Instruction::Run("python -m compileall -q .".to_string())
        );
        assert_eq!(
            file.steps[3].instruction,
            Instruction::Copy {
                sources: vec!["requirements.txt".into(), "requirements.lock".into()],
                destination: "./".into(),
            }
        );
        assert_eq!(
            file.steps[7].instruction,
            Instruction::Entrypoint(EntrypointForm::Exec(vec!["python".into(), "app.py".into()]))
        );
    }

    #[test]
    fn test_env_forms() {
        let file = BuildFile::parse("ENV A=1 B=\"two words\"\nENV LEGACY some value").unwrap();
        assert_eq!(
            file.steps[0].instruction,
            Instruction::Env(vec![
                ("A".into(), "1".into()),
                ("B".into(), "two words".into())
            ])
        );
        assert_eq!(
            file.steps[1].instruction,
            Instruction::Env(vec![("LEGACY".into(), "some value".into())])
        );
        assert!(BuildFile::parse("ENV 1BAD=x").is_err());
    }

    #[test]
    fn test_parse_errors_carry_line() {
        match BuildFile::parse("FROM python:3.11.9-slim\nFROBNICATE x") {
            Err(DockhandError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(BuildFile::parse("COPY onlyone").is_err());
        assert!(BuildFile::parse("COPY --chown=1 a b").is_err());
        assert!(BuildFile::parse("EXPOSE 80 443").is_err());
        assert!(BuildFile::parse("RUN echo \\").is_err());
        assert!(BuildFile::parse("# nothing\n\n").is_err());
    }

    #[test]
    fn test_canonical_is_stable() {
        let a = BuildFile::parse("COPY  a   b  /dst/").unwrap();
        let b = BuildFile::parse("COPY [\"a\", \"b\", \"/dst/\"]").unwrap();
        assert_eq!(
            a.steps[0].instruction.canonical(),
            b.steps[0].instruction.canonical()
        );
    }
}
