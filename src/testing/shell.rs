//! A tiny `sh` subset used by the in-memory provider.
//!
//! Supported: `echo [-n]`, `cat`, `mkdir [-p]`, `touch`, `rm [-f]`,
//! `grep [-q]` (substring match), `pwd`, `true`, `false`, `exit N`, output
//! redirection with `>` and `>>`, and command lists joined by `;`, `&&`
//! and `||`. Words may be single- or double-quoted. There is no variable
//! expansion, globbing, piping or subshells. Relative paths resolve
//! against the environment's working directory.

use std::collections::{BTreeMap, BTreeSet};

/// Files and directories of one in-memory environment.
#[derive(Debug, Clone)]
pub(crate) struct FileSystem {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    cwd: String,
}

impl FileSystem {
    pub(crate) fn new() -> Self {
        let dirs = ["/", "/tmp", "/root", "/home", "/etc", "/usr", "/var"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            files: BTreeMap::new(),
            dirs,
            cwd: "/".to_string(),
        }
    }

    /// Create a filesystem whose commands run in `dir`.
    pub(crate) fn with_workdir(dir: &str) -> Self {
        let mut fs = Self::new();
        fs.create_dir_all(dir);
        fs.cwd = normalize(dir);
        fs
    }

    /// Resolve `path` against the working directory.
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            normalize(path)
        } else {
            normalize(&format!("{}/{}", self.cwd, path))
        }
    }

    pub(crate) fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&self.resolve(path)).map(Vec::as_slice)
    }

    pub(crate) fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(&self.resolve(path))
    }

    /// Write a file, creating missing parent directories.
    pub(crate) fn write_creating_parents(&mut self, path: &str, contents: &[u8]) {
        let path = self.resolve(path);
        self.create_dir_all(parent(&path));
        self.files.insert(path, contents.to_vec());
    }

    /// Write a file whose parent must already exist.
    pub(crate) fn write(&mut self, path: &str, contents: &[u8]) -> Result<(), String> {
        let path = self.resolve(path);
        if !self.dirs.contains(parent(&path)) {
            return Err(format!("can't create {}: nonexistent directory", path));
        }
        if self.dirs.contains(&path) {
            return Err(format!("can't create {}: Is a directory", path));
        }
        self.files.insert(path, contents.to_vec());
        Ok(())
    }

    fn append(&mut self, path: &str, contents: &[u8]) -> Result<(), String> {
        let normalized = self.resolve(path);
        match self.files.get_mut(&normalized) {
            Some(existing) => {
                existing.extend_from_slice(contents);
                Ok(())
            }
            None => self.write(&normalized, contents),
        }
    }

    pub(crate) fn create_dir_all(&mut self, path: &str) {
        let mut current = String::new();
        self.dirs.insert("/".to_string());
        for part in self.resolve(path).split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    /// Files under `dir`, with paths relative to `dir`.
    pub(crate) fn files_under(&self, dir: &str) -> Vec<(String, Vec<u8>)> {
        let dir = self.resolve(dir);
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        self.files
            .iter()
            .filter_map(|(path, contents)| {
                path.strip_prefix(&prefix)
                    .map(|rel| (rel.to_string(), contents.clone()))
            })
            .collect()
    }
}

/// Collapse `.`/`..`/duplicate slashes and resolve relative paths against `/`.
pub(crate) fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Outcome of running a command line.
#[derive(Debug, Default)]
pub(crate) struct ShellOutput {
    pub(crate) exit_code: i32,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Redirect { append: bool },
    And,
    Or,
    Semi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    And,
    Or,
    Semi,
}

#[derive(Debug, Default)]
struct SimpleCommand {
    args: Vec<String>,
    redirect: Option<(bool, String)>,
}

/// Run `line` against `fs`.
pub(crate) fn run(fs: &mut FileSystem, line: &str) -> ShellOutput {
    let mut out = ShellOutput::default();

    let list = match tokenize(line).and_then(parse) {
        Ok(list) => list,
        Err(message) => {
            out.exit_code = 2;
            out.stderr = format!("sh: {}\n", message).into_bytes();
            return out;
        }
    };

    let mut status = 0;
    for (connector, command) in list {
        let skip = match connector {
            Some(Connector::And) => status != 0,
            Some(Connector::Or) => status == 0,
            Some(Connector::Semi) | None => false,
        };
        if skip {
            continue;
        }

        if command.args.first().map(String::as_str) == Some("exit") {
            out.exit_code = command
                .args
                .get(1)
                .and_then(|code| code.parse().ok())
                .unwrap_or(status);
            return out;
        }

        let (code, stdout, stderr) = run_simple(fs, &command.args);
        out.stderr.extend_from_slice(&stderr);
        status = code;

        match command.redirect {
            Some((append, target)) => {
                let written = if append {
                    fs.append(&target, &stdout)
                } else {
                    fs.write(&target, &stdout)
                };
                if let Err(message) = written {
                    out.stderr
                        .extend_from_slice(format!("sh: {}\n", message).as_bytes());
                    status = 2;
                }
            }
            None => out.stdout.extend_from_slice(&stdout),
        }
    }

    out.exit_code = status;
    out
}

fn run_simple(fs: &mut FileSystem, args: &[String]) -> (i32, Vec<u8>, Vec<u8>) {
    let Some((program, rest)) = args.split_first() else {
        return (0, Vec::new(), Vec::new());
    };

    match program.as_str() {
        "true" => (0, Vec::new(), Vec::new()),
        "pwd" => (0, format!("{}\n", fs.cwd).into_bytes(), Vec::new()),
        "false" => (1, Vec::new(), Vec::new()),
        "echo" => {
            let (newline, words) = match rest.split_first() {
                Some((flag, words)) if flag == "-n" => (false, words),
                _ => (true, rest),
            };
            let mut text = words.join(" ");
            if newline {
                text.push('\n');
            }
            (0, text.into_bytes(), Vec::new())
        }
        "cat" => {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut code = 0;
            for path in rest {
                match fs.read(path) {
                    Some(contents) => stdout.extend_from_slice(contents),
                    None => {
                        stderr.extend_from_slice(
                            format!("cat: can't open '{}': No such file or directory\n", path)
                                .as_bytes(),
                        );
                        code = 1;
                    }
                }
            }
            (code, stdout, stderr)
        }
        "mkdir" => {
            for dir in rest.iter().filter(|a| !a.starts_with('-')) {
                fs.create_dir_all(dir);
            }
            (0, Vec::new(), Vec::new())
        }
        "touch" => {
            let mut stderr = Vec::new();
            let mut code = 0;
            for path in rest {
                if fs.read(path).is_none() {
                    if let Err(message) = fs.write(path, b"") {
                        stderr.extend_from_slice(format!("touch: {}\n", message).as_bytes());
                        code = 1;
                    }
                }
            }
            (code, Vec::new(), stderr)
        }
        "rm" => {
            let force = rest.iter().any(|a| a == "-f");
            let mut code = 0;
            let mut stderr = Vec::new();
            for path in rest.iter().filter(|a| !a.starts_with('-')) {
                let target = fs.resolve(path);
                if fs.files.remove(&target).is_none() && !force {
                    stderr.extend_from_slice(
                        format!("rm: can't remove '{}': No such file or directory\n", path)
                            .as_bytes(),
                    );
                    code = 1;
                }
            }
            (code, Vec::new(), stderr)
        }
        "grep" => {
            let quiet = rest.iter().any(|a| a == "-q");
            let operands: Vec<&String> = rest.iter().filter(|a| !a.starts_with('-')).collect();
            let (Some(pattern), Some(path)) = (operands.first(), operands.get(1)) else {
                return (2, Vec::new(), b"grep: missing operand\n".to_vec());
            };
            let Some(contents) = fs.read(path) else {
                return (
                    2,
                    Vec::new(),
                    format!("grep: {}: No such file or directory\n", path).into_bytes(),
                );
            };

            let text = String::from_utf8_lossy(contents).to_string();
            let matches: Vec<&str> = text.lines().filter(|l| l.contains(pattern.as_str())).collect();
            let code = if matches.is_empty() { 1 } else { 0 };
            let stdout = if quiet {
                Vec::new()
            } else {
                matches
                    .iter()
                    .map(|l| format!("{}\n", l))
                    .collect::<String>()
                    .into_bytes()
            };
            (code, stdout, Vec::new())
        }
        other => (
            127,
            Vec::new(),
            format!("sh: {}: not found\n", other).into_bytes(),
        ),
    }
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    let mut word = String::new();
    let mut in_word = false;

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => word.push(ch),
                        None => return Err("unterminated quoted string".into()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => word.push(ch),
                            Some(ch) => {
                                word.push('\\');
                                word.push(ch);
                            }
                            None => return Err("unterminated quoted string".into()),
                        },
                        Some(ch) => word.push(ch),
                        None => return Err("unterminated quoted string".into()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    word.push(ch);
                }
            }
            '>' | '&' | '|' | ';' => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                    in_word = false;
                }
                let token = match (c, chars.peek()) {
                    ('>', Some('>')) => {
                        chars.next();
                        Token::Redirect { append: true }
                    }
                    ('>', _) => Token::Redirect { append: false },
                    ('&', Some('&')) => {
                        chars.next();
                        Token::And
                    }
                    ('|', Some('|')) => {
                        chars.next();
                        Token::Or
                    }
                    (';', _) => Token::Semi,
                    (other, _) => return Err(format!("unsupported operator '{}'", other)),
                };
                tokens.push(token);
            }
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }

    if in_word {
        tokens.push(Token::Word(word));
    }
    Ok(tokens)
}

fn parse(tokens: Vec<Token>) -> Result<Vec<(Option<Connector>, SimpleCommand)>, String> {
    let mut list = Vec::new();
    let mut connector = None;
    let mut current = SimpleCommand::default();
    let mut tokens = tokens.into_iter();

    while let Some(token) = tokens.next() {
        match token {
            Token::Word(word) => current.args.push(word),
            Token::Redirect { append } => match tokens.next() {
                Some(Token::Word(target)) => current.redirect = Some((append, target)),
                _ => return Err("syntax error: missing redirect target".into()),
            },
            Token::And | Token::Or | Token::Semi => {
                if current.args.is_empty() {
                    return Err("syntax error: empty command".into());
                }
                list.push((connector, std::mem::take(&mut current)));
                connector = Some(match token {
                    Token::And => Connector::And,
                    Token::Or => Connector::Or,
                    _ => Connector::Semi,
                });
            }
        }
    }

    if !current.args.is_empty() || current.redirect.is_some() {
        list.push((connector, current));
    } else if matches!(connector, Some(Connector::And | Connector::Or)) {
        return Err("syntax error: unexpected end of input".into());
    }
    Ok(list)
}
