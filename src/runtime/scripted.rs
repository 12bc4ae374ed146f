//! Deterministic runtime driven by per-item scripts.
//!
//! Each `latest_output` call advances the session one frame, so a test
//! controls exactly what the supervisor sees on every poll.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{LiveSession, RuntimeError, SpawnSpec, WorkerObservable, WorkerRuntime};

type SpawnHook = Arc<dyn Fn(&SpawnSpec) + Send + Sync>;

/// Behaviour of one scripted session.
#[derive(Clone, Default)]
pub struct Script {
    frames: Vec<String>,
    exit_after: Option<usize>,
    after_input: Vec<String>,
    on_spawn: Option<SpawnHook>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("frames", &self.frames)
            .field("exit_after", &self.exit_after)
            .field("after_input", &self.after_input)
            .finish_non_exhaustive()
    }
}

impl Script {
    /// A session that prints nothing and never exits.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Output snapshots, one per poll; the last frame repeats.
    pub fn frames<'a>(frames: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            frames: frames.into_iter().map(str::to_string).collect(),
            ..Self::default()
        }
    }

    /// Session exits once `polls` output snapshots have been taken.
    #[must_use]
    pub const fn exit_after(mut self, polls: usize) -> Self {
        self.exit_after = Some(polls);
        self
    }

    /// Frames shown after the first input is sent to the session.
    #[must_use]
    pub fn after_input<'a>(mut self, frames: impl IntoIterator<Item = &'a str>) -> Self {
        self.after_input = frames.into_iter().map(str::to_string).collect();
        self
    }

    /// Run a side effect when the session is spawned (e.g. open a PR).
    #[must_use]
    pub fn on_spawn(mut self, f: impl Fn(&SpawnSpec) + Send + Sync + 'static) -> Self {
        self.on_spawn = Some(Arc::new(f));
        self
    }
}

#[derive(Debug)]
struct Session {
    script: Script,
    polls: usize,
    alive: bool,
    inputs: Vec<String>,
}

impl Session {
    fn current(&self) -> String {
        let frames = if self.inputs.is_empty() || self.script.after_input.is_empty() {
            &self.script.frames
        } else {
            &self.script.after_input
        };
        let idx = self.polls.saturating_sub(1).min(frames.len().saturating_sub(1));
        frames.get(idx).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<u64, VecDeque<Script>>,
    default_script: Script,
    sessions: BTreeMap<String, Session>,
    failing_spawns: HashSet<u64>,
    external: Vec<LiveSession>,
    spawned: Vec<SpawnSpec>,
    killed: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    inner: Mutex<Inner>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a script for the next spawn on `item`. The last queued script is
    /// reused for every later attempt.
    pub fn script(&self, item: u64, script: Script) {
        self.lock().scripts.entry(item).or_default().push_back(script);
    }

    pub fn default_script(&self, script: Script) {
        self.lock().default_script = script;
    }

    pub fn fail_spawn(&self, item: u64) {
        self.lock().failing_spawns.insert(item);
    }

    /// A session started outside this process that the runtime still reports.
    pub fn add_external_session(&self, name: &str, item: Option<u64>) {
        self.lock().external.push(LiveSession {
            name: name.to_string(),
            item,
        });
    }

    pub fn spawned(&self) -> Vec<SpawnSpec> {
        self.lock().spawned.clone()
    }

    pub fn spawn_count(&self, item: u64) -> usize {
        self.lock().spawned.iter().filter(|s| s.item == item).count()
    }

    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    pub fn inputs(&self, session: &str) -> Vec<String> {
        self.lock()
            .sessions
            .get(session)
            .map(|s| s.inputs.clone())
            .unwrap_or_default()
    }
}

impl WorkerObservable for ScriptedRuntime {
    fn latest_output(&self, session: &str) -> Result<String, RuntimeError> {
        let mut inner = self.lock();
        let s = inner
            .sessions
            .get_mut(session)
            .ok_or_else(|| RuntimeError::NotFound(session.to_string()))?;
        if s.alive {
            s.polls += 1;
            if s.script.exit_after.is_some_and(|n| s.polls >= n) {
                s.alive = false;
            }
        }
        Ok(s.current())
    }

    fn is_alive(&self, session: &str) -> Result<bool, RuntimeError> {
        Ok(self.lock().sessions.get(session).is_some_and(|s| s.alive))
    }
}

impl WorkerRuntime for ScriptedRuntime {
    fn spawn(&self, spec: &SpawnSpec) -> Result<(), RuntimeError> {
        let script = {
            let mut inner = self.lock();
            if inner.failing_spawns.contains(&spec.item) {
                return Err(RuntimeError::SpawnFailed {
                    session: spec.name.clone(),
                    detail: "scripted spawn failure".into(),
                });
            }
            let queued = match inner.scripts.get_mut(&spec.item) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            let script = queued.unwrap_or_else(|| inner.default_script.clone());
            inner.spawned.push(spec.clone());
            inner.sessions.insert(
                spec.name.clone(),
                Session {
                    script: script.clone(),
                    polls: 0,
                    alive: true,
                    inputs: Vec::new(),
                },
            );
            script
        };
        // Outside the lock: the hook may call back into the runtime.
        if let Some(hook) = &script.on_spawn {
            hook(spec);
        }
        Ok(())
    }

    fn send_input(&self, session: &str, text: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        let s = inner
            .sessions
            .get_mut(session)
            .ok_or_else(|| RuntimeError::NotFound(session.to_string()))?;
        s.inputs.push(text.to_string());
        Ok(())
    }

    fn kill(&self, session: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        if let Some(s) = inner.sessions.get_mut(session) {
            s.alive = false;
        }
        inner.killed.push(session.to_string());
        Ok(())
    }

    fn live_sessions(&self) -> Result<Vec<LiveSession>, RuntimeError> {
        let inner = self.lock();
        let mut live: Vec<LiveSession> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.alive)
            .map(|(name, _)| LiveSession {
                name: name.clone(),
                item: inner
                    .spawned
                    .iter()
                    .rev()
                    .find(|spec| &spec.name == name)
                    .map(|spec| spec.item),
            })
            .collect();
        live.extend(inner.external.iter().cloned());
        Ok(live)
    }
}
