//! Fixtures shared by unit tests: throwaway git repositories and a scripted agent.

use anyhow::Result;
use async_trait::async_trait;
use git2::{Repository, RepositoryInitOptions};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tempfile::{TempDir, tempdir};

use crate::agent::{AgentInvoker, AgentOutput, AgentPhase, AgentRequest};

/// Init a repository on `main` with one commit containing `README.md`
/// and a `.gitignore` covering the worktree base and state file.
pub fn init_repo() -> TempDir {
    let dir = tempdir().unwrap();
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir.path(), &opts).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    config.set_bool("commit.gpgsign", false).unwrap();
    drop(config);
    fs::write(
        dir.path().join(".gitignore"),
        ".worktrees/\n.parallel-state.json\n",
    )
    .unwrap();
    commit_file(dir.path(), "README.md", "# test\n", "init");
    dir
}

/// Write `name` and commit every change in the repository.
pub fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
    let repo = Repository::open(dir).unwrap();
    let file_path = dir.join(name);
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&file_path, content).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    if let Ok(head) = repo.head() {
        let parent = head.peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
            .unwrap();
    } else {
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
            .unwrap();
    }
}

/// Number of commits reachable from `rev`.
pub fn commit_count(dir: &Path, rev: &str) -> usize {
    let repo = Repository::open(dir).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push(repo.revparse_single(rev).unwrap().id()).unwrap();
    walk.count()
}

type Script = Box<dyn Fn(&AgentRequest) -> AgentOutput + Send + Sync>;

/// Agent double whose behaviour per phase is a closure. Records every request.
pub struct ScriptedAgent {
    ready: Script,
    implement: Script,
    pub calls: Mutex<Vec<(String, AgentPhase)>>,
}

impl ScriptedAgent {
    pub fn new(
        ready: impl Fn(&AgentRequest) -> AgentOutput + Send + Sync + 'static,
        implement: impl Fn(&AgentRequest) -> AgentOutput + Send + Sync + 'static,
    ) -> Self {
        Self {
            ready: Box::new(ready),
            implement: Box::new(implement),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Ready verdict for every issue; implementation writes `src/<issue>.rs`.
    pub fn happy() -> Self {
        Self::new(
            |_| ok("VERDICT: READY"),
            |req| {
                write_in(req, &format!("src/{}.rs", req.issue_id.to_lowercase()), "// fix\n");
                ok("done")
            },
        )
    }

    pub fn calls_for(&self, phase: AgentPhase) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| *p == phase)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((request.issue_id.clone(), request.phase));
        Ok(match request.phase {
            AgentPhase::Ready => (self.ready)(request),
            AgentPhase::Implement => (self.implement)(request),
        })
    }
}

pub fn ok(stdout: &str) -> AgentOutput {
    AgentOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        ..Default::default()
    }
}

pub fn failed(code: i32, stderr: &str) -> AgentOutput {
    AgentOutput {
        exit_code: code,
        stderr: stderr.to_string(),
        ..Default::default()
    }
}

/// Write a file relative to the request's working directory.
pub fn write_in(request: &AgentRequest, rel: &str, content: &str) {
    let path = request.cwd.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}
