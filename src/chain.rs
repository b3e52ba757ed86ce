//! Typed command chains
//!
//! A privileged transaction is an ordered list of shell steps executed under a
//! single elevation prompt. Steps are built from structured words instead of
//! pre-formatted strings, and quoting happens in exactly one place
//! (`shell_quote`) when the chain is serialized for the elevation helper.
//!
//! # Lifecycle
//!
//! ```text
//! ChainBuilder (append-only) --freeze()--> CommandChain (immutable, executed once)
//! ```
//!
//! There is no way to add a step to a `CommandChain`; ordering is fixed at
//! `freeze()` time and preserved exactly by `to_shell_script()`.

use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

use crate::types::StepTag;

/// Characters that never need quoting in a POSIX shell word
fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
}

/// Quote `s` for a POSIX shell.
///
/// Safe words are returned unchanged; everything else is wrapped in single
/// quotes with embedded single quotes written as `'\''`.
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    if !s.is_empty() && s.chars().all(is_shell_safe) {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("'{}'", s.replace('\'', r"'\''")))
    }
}

/// One word of a shell step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Word {
    /// Passed through `shell_quote`
    Literal(String),
    /// Emitted verbatim: globs and command substitutions such as `$(uname -r)`.
    /// Only ever built from static templates, never from caller input.
    Raw(String),
}

impl Word {
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Self::Literal(s) => shell_quote(s),
            Self::Raw(s) => Cow::Borrowed(s.as_str()),
        }
    }
}

/// A single step of a chain: program, arguments and optional shell plumbing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStep {
    tag: StepTag,
    words: Vec<Word>,
    stdout_to: Option<String>,
    only_if_file: Option<String>,
    tolerate_failure: bool,
}

impl ChainStep {
    pub fn new(tag: StepTag, program: impl Into<String>) -> Self {
        Self {
            tag,
            words: vec![Word::Literal(program.into())],
            stdout_to: None,
            only_if_file: None,
            tolerate_failure: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.words.push(Word::Literal(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.words.extend(args.into_iter().map(|a| Word::Literal(a.into())));
        self
    }

    /// Append an unquoted word (glob or command substitution).
    pub fn raw_arg(mut self, arg: impl Into<String>) -> Self {
        self.words.push(Word::Raw(arg.into()));
        self
    }

    pub fn word(mut self, word: Word) -> Self {
        self.words.push(word);
        self
    }

    /// Redirect stdout of the step into `path` (truncating).
    pub fn write_stdout_to(mut self, path: impl Into<String>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    /// Only run the step when `path` is an existing regular file.
    /// A missing file counts as success.
    pub fn only_if_file_exists(mut self, path: impl Into<String>) -> Self {
        self.only_if_file = Some(path.into());
        self
    }

    /// A failing step does not abort the rest of the chain.
    pub fn tolerate_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    pub fn tag(&self) -> StepTag {
        self.tag
    }

    pub fn program(&self) -> &str {
        match self.words.first() {
            Some(Word::Literal(s)) | Some(Word::Raw(s)) => s,
            None => "",
        }
    }

    pub fn is_tolerant(&self) -> bool {
        self.tolerate_failure
    }

    /// Serialize this step to a single shell command.
    pub fn render(&self) -> String {
        let mut cmd = self
            .words
            .iter()
            .map(|w| w.render())
            .collect::<Vec<_>>()
            .join(" ");

        if let Some(ref target) = self.stdout_to {
            cmd = format!("{} > {}", cmd, shell_quote(target));
        }
        if self.tolerate_failure {
            cmd = format!("{{ {} || true; }}", cmd);
        }
        if let Some(ref path) = self.only_if_file {
            cmd = format!("if [ -f {} ]; then {}; fi", shell_quote(path), cmd);
        }
        cmd
    }
}

impl fmt::Display for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Append-only builder for a `CommandChain`
#[derive(Debug, Clone, Default)]
pub struct ChainBuilder {
    task_name: String,
    env: Vec<(String, String)>,
    steps: Vec<ChainStep>,
}

impl ChainBuilder {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            env: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: ChainStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn extend<I: IntoIterator<Item = ChainStep>>(&mut self, steps: I) -> &mut Self {
        self.steps.extend(steps);
        self
    }

    /// Export an environment variable for every step of the chain.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Finish construction. The resulting chain cannot be modified.
    pub fn freeze(self) -> CommandChain {
        CommandChain {
            task_name: self.task_name,
            env: self.env,
            steps: self.steps,
        }
    }
}

/// Frozen, ordered chain of privileged steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandChain {
    task_name: String,
    env: Vec<(String, String)>,
    steps: Vec<ChainStep>,
}

impl CommandChain {
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn tags(&self) -> Vec<StepTag> {
        self.steps.iter().map(ChainStep::tag).collect()
    }

    /// Rendered commands in execution order (the "execution plan").
    pub fn commands(&self) -> Vec<String> {
        self.steps.iter().map(ChainStep::render).collect()
    }

    /// Steps carrying `tag`, in order.
    pub fn steps_tagged(&self, tag: StepTag) -> impl Iterator<Item = &ChainStep> {
        self.steps.iter().filter(move |s| s.tag == tag)
    }

    /// The whole chain as one shell script: exports first, then every step
    /// joined with `&&` so the first failing step aborts the rest.
    pub fn to_shell_script(&self) -> String {
        self.env
            .iter()
            .map(|(k, v)| format!("export {}={}", k, shell_quote(v)))
            .chain(self.steps.iter().map(ChainStep::render))
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_safe_words_unchanged() {
        assert_eq!(shell_quote("apt-get"), "apt-get");
        assert_eq!(shell_quote("/etc/X11/xorg.conf"), "/etc/X11/xorg.conf");
        assert_eq!(shell_quote("nvidia-driver-535-open"), "nvidia-driver-535-open");
    }

    #[test]
    fn test_shell_quote_special_characters() {
        assert_eq!(shell_quote("^nvidia-.*"), "'^nvidia-.*'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("x; rm -rf /"), "'x; rm -rf /'");
    }

    #[test]
    fn test_step_render_plain_and_raw() {
        let step = ChainStep::new(StepTag::PrepareDeps, "apt-get")
            .args(["install", "-y", "build-essential"])
            .raw_arg("linux-headers-$(uname -r)");
        assert_eq!(
            step.render(),
            "apt-get install -y build-essential linux-headers-$(uname -r)"
        );
        assert_eq!(step.program(), "apt-get");
    }

    #[test]
    fn test_step_render_redirect() {
        let step = ChainStep::new(StepTag::Blacklist, "printf")
            .arg("blacklist nouveau\\noptions nouveau modeset=0\\n")
            .write_stdout_to("/etc/modprobe.d/blacklist-nouveau.conf");
        assert_eq!(
            step.render(),
            "printf 'blacklist nouveau\\noptions nouveau modeset=0\\n' > /etc/modprobe.d/blacklist-nouveau.conf"
        );
    }

    #[test]
    fn test_step_render_guard_and_tolerance() {
        let guarded = ChainStep::new(StepTag::Backup, "cp")
            .args(["/etc/X11/xorg.conf", "/etc/X11/xorg.conf.bak"])
            .only_if_file_exists("/etc/X11/xorg.conf");
        assert_eq!(
            guarded.render(),
            "if [ -f /etc/X11/xorg.conf ]; then cp /etc/X11/xorg.conf /etc/X11/xorg.conf.bak; fi"
        );

        let tolerant = ChainStep::new(StepTag::Cleanup, "update-alternatives")
            .args(["--auto", "glx"])
            .tolerate_failure();
        assert_eq!(tolerant.render(), "{ update-alternatives --auto glx || true; }");
    }

    #[test]
    fn test_chain_preserves_order_and_joins_with_and() {
        let mut builder = ChainBuilder::new("demo");
        builder
            .env("DEBIAN_FRONTEND", "noninteractive")
            .push(ChainStep::new(StepTag::RepoUpdate, "apt-get").arg("update"))
            .push(ChainStep::new(StepTag::DriverAction, "apt-get").args(["install", "-y", "x"]))
            .push(ChainStep::new(StepTag::FinalizeBoot, "update-initramfs").arg("-u"));
        let chain = builder.freeze();

        assert_eq!(
            chain.tags(),
            vec![StepTag::RepoUpdate, StepTag::DriverAction, StepTag::FinalizeBoot]
        );
        assert_eq!(
            chain.to_shell_script(),
            "export DEBIAN_FRONTEND=noninteractive && apt-get update && apt-get install -y x && update-initramfs -u"
        );
        assert_eq!(chain.commands().len(), 3);
        assert_eq!(chain.steps_tagged(StepTag::FinalizeBoot).count(), 1);
    }

    #[test]
    fn test_tolerant_step_does_not_mask_earlier_failures() {
        // `a && { b || true; } && c` - a failing `a` still aborts the chain
        let mut builder = ChainBuilder::new("demo");
        builder
            .push(ChainStep::new(StepTag::Cleanup, "a"))
            .push(ChainStep::new(StepTag::Cleanup, "b").tolerate_failure())
            .push(ChainStep::new(StepTag::Cleanup, "c"));
        assert_eq!(builder.freeze().to_shell_script(), "a && { b || true; } && c");
    }
}
