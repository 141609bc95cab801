use async_trait::async_trait;
use inkbridge::cloud::{CloudError, NotebookClient, PageUpload};
use inkbridge::deploy::artifacts::{AgentArtifacts, AgentSettings};
use inkbridge::model::types::{PageRecord, PageStatus};
use inkbridge::remote::{CommandOutput, RemoteError, RemoteShell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Fake device
// =============================================================================

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub contents: Vec<u8>,
    pub mode: i32,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitState {
    pub enabled: bool,
    pub active: bool,
}

/// In-memory tablet that understands the handful of shell commands the
/// orchestrator sends. `/etc` stays read-only until `mount -o remount,rw /`.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct FakeDevice {
    pub files: BTreeMap<String, FakeFile>,
    pub dirs: BTreeSet<String>,
    pub units: BTreeMap<String, UnitState>,
    pub commands: Vec<String>,
    pub uploads: Vec<String>,
    pub connected: bool,
    pub root_writable: bool,
    failing_commands: Vec<(String, String)>,
    failing_uploads: Vec<String>,
    dropping_commands: Vec<String>,
}

#[allow(dead_code)]
impl FakeDevice {
    pub fn new() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    /// Any command containing `needle` exits 1 with `stderr`.
    pub fn fail_command(&mut self, needle: &str, stderr: &str) {
        self.failing_commands
            .push((needle.to_string(), stderr.to_string()));
    }

    /// Uploads to paths containing `needle` fail.
    pub fn fail_upload(&mut self, needle: &str) {
        self.failing_uploads.push(needle.to_string());
    }

    /// The link resets when a command containing `needle` runs.
    pub fn drop_link_on(&mut self, needle: &str) {
        self.dropping_commands.push(needle.to_string());
    }

    pub fn clear_failures(&mut self) {
        self.failing_commands.clear();
        self.failing_uploads.clear();
        self.dropping_commands.clear();
    }

    pub fn file(&self, path: &str) -> Option<&FakeFile> {
        self.files.get(path)
    }

    pub fn file_text(&self, path: &str) -> Option<String> {
        self.files
            .get(path)
            .map(|f| String::from_utf8_lossy(&f.contents).into_owned())
    }

    pub fn put_file(&mut self, path: &str, contents: &[u8]) {
        self.add_parents(path);
        self.files.insert(
            path.to_string(),
            FakeFile {
                contents: contents.to_vec(),
                mode: 0o644,
            },
        );
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands.iter().any(|c| c.contains(needle))
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = String::new();
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn mkdir(&mut self, path: &str) {
        self.add_parents(path);
        self.dirs.insert(path.trim_end_matches('/').to_string());
    }

    fn dir_exists(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.dirs.contains(path.trim_end_matches('/'))
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn remove_tree(&mut self, path: &str) {
        let root = path.trim_end_matches('/').to_string();
        let prefix = format!("{root}/");
        self.files.retain(|f, _| *f != root && !f.starts_with(&prefix));
        self.dirs.retain(|d| *d != root && !d.starts_with(&prefix));
    }

    fn copy_tree(&mut self, src: &str, dst: &str) -> bool {
        let src = src.trim_end_matches('.').trim_end_matches('/');
        let dst = dst.trim_end_matches('/');
        if !self.dir_exists(src) {
            return false;
        }
        let prefix = format!("{src}/");
        let copies: Vec<(String, FakeFile)> = self
            .files
            .iter()
            .filter_map(|(path, file)| {
                path.strip_prefix(&prefix)
                    .map(|rel| (format!("{dst}/{rel}"), file.clone()))
            })
            .collect();
        self.mkdir(dst);
        for (path, file) in copies {
            self.add_parents(&path);
            self.files.insert(path, file);
        }
        true
    }

    fn unit_file_exists(&self, unit: &str) -> bool {
        self.files.contains_key(&format!("/etc/systemd/system/{unit}"))
    }

    fn run_single(&mut self, command: &str) -> CommandOutput {
        let words: Vec<String> = command
            .split_whitespace()
            .map(|w| w.trim_matches('\'').to_string())
            .collect();
        let args: Vec<&str> = words.iter().map(String::as_str).collect();

        match args.as_slice() {
            ["echo", rest @ ..] => ok(&format!("{}\n", rest.join(" "))),
            ["test", "-d", path] => status(self.dir_exists(path)),
            ["test", "-f", path] => status(self.files.contains_key(*path)),
            ["cat", path] => match self.files.get(*path) {
                Some(file) => ok(&String::from_utf8_lossy(&file.contents)),
                None => fail(1, &format!("cat: {path}: No such file or directory")),
            },
            ["mount", "-o", "remount,rw", "/"] => {
                self.root_writable = true;
                ok("")
            }
            ["mkdir", "-p", paths @ ..] => {
                for path in paths {
                    if path.starts_with("/etc") && !self.root_writable {
                        return fail(1, "mkdir: Read-only file system");
                    }
                    self.mkdir(path);
                }
                ok("")
            }
            ["rm", "-f", path] => {
                self.files.remove(*path);
                ok("")
            }
            ["rm", "-rf", path] => {
                self.remove_tree(path);
                ok("")
            }
            ["cp", "-a", src, dst] => {
                if self.copy_tree(src, dst) {
                    ok("")
                } else {
                    fail(1, &format!("cp: cannot stat '{src}': No such file or directory"))
                }
            }
            ["systemctl", "daemon-reload"] => ok(""),
            ["systemctl", "is-active", unit] => {
                if self.units.get(*unit).is_some_and(|u| u.active) {
                    ok("active\n")
                } else {
                    CommandOutput {
                        stdout: "inactive\n".into(),
                        stderr: String::new(),
                        exit_code: 3,
                    }
                }
            }
            ["systemctl", verb @ ("enable" | "restart"), unit] => {
                if !self.unit_file_exists(unit) {
                    return fail(5, &format!("Unit {unit} not found."));
                }
                let state = self.units.entry(unit.to_string()).or_default();
                if *verb == "enable" {
                    state.enabled = true;
                } else {
                    state.active = true;
                }
                ok("")
            }
            ["systemctl", verb @ ("stop" | "disable"), unit] => {
                let Some(state) = self.units.get_mut(*unit) else {
                    return fail(5, &format!("Unit {unit} not loaded."));
                };
                if *verb == "stop" {
                    state.active = false;
                } else {
                    state.enabled = false;
                }
                ok("")
            }
            _ => fail(127, &format!("sh: {command}: not found")),
        }
    }

    fn run_chain(&mut self, chain: &str) -> CommandOutput {
        let mut stdout = String::new();
        for part in chain.split(" && ") {
            let out = self.run_single(part.trim());
            stdout.push_str(&out.stdout);
            if !out.success() {
                return CommandOutput { stdout, ..out };
            }
        }
        ok(&stdout)
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: format!("{stderr}\n"),
        exit_code,
    }
}

fn status(success: bool) -> CommandOutput {
    if success { ok("") } else { fail(1, "") }
}

impl RemoteShell for FakeDevice {
    fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        if !self.connected {
            return Err(RemoteError::NotConnected);
        }
        self.commands.push(command.to_string());
        if self
            .dropping_commands
            .iter()
            .any(|needle| command.contains(needle.as_str()))
        {
            self.connected = false;
            return Err(RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        if let Some((_, stderr)) = self
            .failing_commands
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
        {
            return Ok(fail(1, &stderr.clone()));
        }

        Ok(match command.split_once(" || ") {
            Some((first, fallback)) => {
                let out = self.run_chain(first);
                if out.success() {
                    out
                } else {
                    self.run_chain(fallback)
                }
            }
            None => self.run_chain(command),
        })
    }

    fn upload_bytes(
        &mut self,
        contents: &[u8],
        remote_path: &str,
        mode: i32,
    ) -> Result<(), RemoteError> {
        if !self.connected {
            return Err(RemoteError::NotConnected);
        }
        let transfer_err = |reason: &str| RemoteError::Transfer {
            path: remote_path.to_string(),
            reason: reason.to_string(),
        };
        if self
            .failing_uploads
            .iter()
            .any(|needle| remote_path.contains(needle.as_str()))
        {
            return Err(transfer_err("injected failure"));
        }
        if remote_path.starts_with("/etc") && !self.root_writable {
            return Err(transfer_err("Read-only file system"));
        }
        self.uploads.push(remote_path.to_string());
        self.add_parents(remote_path);
        self.files.insert(
            remote_path.to_string(),
            FakeFile {
                contents: contents.to_vec(),
                mode,
            },
        );
        Ok(())
    }

    fn download_file(
        &mut self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<u64, RemoteError> {
        let file = self
            .files
            .get(remote_path)
            .ok_or_else(|| RemoteError::Transfer {
                path: remote_path.to_string(),
                reason: "no such file".into(),
            })?;
        std::fs::write(local_path, &file.contents)?;
        Ok(file.contents.len() as u64)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Agent binaries written to `dir`, ready for [`AgentArtifacts::verify`].
#[allow(dead_code)]
pub fn agent_artifacts(dir: &Path, version: &str) -> AgentArtifacts {
    let artifacts = AgentArtifacts::from_dir(dir, version);
    for binary in &artifacts.binaries {
        std::fs::write(&binary.local_path, format!("#!/bin/sh\n# {}\n", binary.name)).unwrap();
    }
    artifacts
}

#[allow(dead_code)]
pub fn agent_settings() -> AgentSettings {
    AgentSettings::new("http://10.11.99.2:8080", "ink_test_key", "rm2-test")
}

// =============================================================================
// Cloud client
// =============================================================================

#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct RecordingState {
    pub notebooks: HashMap<String, String>,
    pub sections: HashMap<(String, String), String>,
    /// (section id, upload) in call order.
    pub pages: Vec<(String, PageUpload)>,
    pub calls: Vec<String>,
    next_id: usize,
}

/// In-memory notebook service that records every call.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct RecordingNotebookClient {
    pub state: Mutex<RecordingState>,
    failing_titles: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl RecordingNotebookClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads of pages with this title fail with a 503.
    pub fn fail_title(&self, title: &str) {
        self.failing_titles.lock().unwrap().insert(title.to_string());
    }

    pub fn heal(&self) {
        self.failing_titles.lock().unwrap().clear();
    }

    pub fn uploaded_titles(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .map(|(_, p)| p.title.clone())
            .collect()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl RecordingState {
    fn mint(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{kind}-{}", self.next_id)
    }
}

#[async_trait]
impl NotebookClient for RecordingNotebookClient {
    async fn find_notebook(&self, display_name: &str) -> Result<Option<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("find_notebook {display_name}"));
        Ok(state.notebooks.get(display_name).cloned())
    }

    async fn create_notebook(&self, display_name: &str) -> Result<String, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_notebook {display_name}"));
        let id = state.mint("nb");
        state.notebooks.insert(display_name.to_string(), id.clone());
        Ok(id)
    }

    async fn find_section(
        &self,
        notebook_id: &str,
        display_name: &str,
    ) -> Result<Option<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("find_section {notebook_id} {display_name}"));
        Ok(state
            .sections
            .get(&(notebook_id.to_string(), display_name.to_string()))
            .cloned())
    }

    async fn create_section(
        &self,
        notebook_id: &str,
        display_name: &str,
    ) -> Result<String, CloudError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("create_section {notebook_id} {display_name}"));
        let id = state.mint("sec");
        state.sections.insert(
            (notebook_id.to_string(), display_name.to_string()),
            id.clone(),
        );
        Ok(id)
    }

    async fn upload_page(&self, section_id: &str, page: &PageUpload) -> Result<String, CloudError> {
        if self.failing_titles.lock().unwrap().contains(&page.title) {
            return Err(CloudError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("upload_page {section_id} {}", page.title));
        let id = state.mint("page");
        state.pages.push((section_id.to_string(), page.clone()));
        Ok(id)
    }
}

// =============================================================================
// Store fixtures
// =============================================================================

/// A Pending page whose bytes live at `dir/{document_id}/{page_id}.rm`.
#[allow(dead_code)]
pub fn pending_page(
    dir: &Path,
    document_id: &str,
    page_id: &str,
    virtual_path: &str,
    last_modified: i64,
) -> PageRecord {
    let destination = inkbridge::ingest::virtual_path::decompose(virtual_path);
    let local_path: PathBuf = dir.join(document_id).join(format!("{page_id}.rm"));
    std::fs::create_dir_all(local_path.parent().unwrap()).unwrap();
    let body = format!("page {document_id}/{page_id}");
    std::fs::write(&local_path, &body).unwrap();
    PageRecord {
        document_id: document_id.into(),
        page_id: page_id.into(),
        virtual_path: virtual_path.into(),
        local_path,
        size_bytes: body.len() as u64,
        content_hash: String::new(),
        notebook: destination.notebook,
        section: destination.section,
        page_name: destination.page,
        status: PageStatus::Pending,
        retry_count: 0,
        last_error: None,
        cloud_page_id: None,
        last_sync_time: None,
        created_at: last_modified,
        last_modified,
    }
}
