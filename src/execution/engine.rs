//! Module Execution Engine
//!
//! The core engine that runs a module's step graph:
//! - Seeding the render context from options, globals and run metadata
//! - Dependency-aware scheduling with a bounded worker count
//! - Exclusive (`parallel: false`) steps
//! - Merging step results back into the shared context
//! - Deadlock detection and failure reporting

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use log::{error, info, warn};
use serde_json::Value;

use crate::error::{EngineError, StepFailure};
use crate::module::{load_module, ModuleDefinition, ModuleResolver, OptionSet, OptionValue};
use crate::monitoring::ProgressReporter;
use crate::output::OutputParser;
use crate::template::RenderContext;

use super::scheduler::ExecutionState;
use super::step::{StepExecutor, StepResult};

/// Completion wait tick.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Worker count when the `threads` variable is absent or invalid.
pub const DEFAULT_THREADS: usize = 10;

type Completion = (String, Result<StepResult, EngineError>);

/// Caller-supplied settings for one run.
///
/// # Example
///
/// ```rust,no_run
/// use reconflow::{ModuleEngine, RunContext};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut engine = ModuleEngine::load("modules/recon/subdomains.yml")?;
///     engine.update_option("domain", "example.com");
///
///     let context = RunContext::new()
///         .with_project_path("/data/projects/acme")
///         .with_global("api_key", "secret");
///
///     for (step, result) in engine.run(&context)? {
///         println!("{}: {} bytes of output", step, result.stdout.len());
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct RunContext {
    project_path: Option<PathBuf>,
    globals: RenderContext,
    resolver: Option<Arc<dyn ModuleResolver>>,
    background: bool,
    depth: usize,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that receives step output. Defaults to the system temp dir.
    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    /// Adds a global (or secret) value visible to templates.
    pub fn with_global(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.globals.insert(key.into(), value.into());
        self
    }

    /// Lookup hook for sub-module references.
    pub fn with_resolver(mut self, resolver: Arc<dyn ModuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Suppresses all progress output.
    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn project_path(&self) -> PathBuf {
        self.project_path.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn globals(&self) -> &RenderContext {
        &self.globals
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn resolver(&self) -> Option<&Arc<dyn ModuleResolver>> {
        self.resolver.as_ref()
    }

    /// Context for a sub-module run one level deeper.
    pub(crate) fn nested(&self, project_path: &Path) -> Self {
        Self {
            project_path: Some(project_path.to_path_buf()),
            globals: self.globals.clone(),
            resolver: self.resolver.clone(),
            background: true,
            depth: self.depth + 1,
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("project_path", &self.project_path)
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .field("resolver", &self.resolver.is_some())
            .field("background", &self.background)
            .field("depth", &self.depth)
            .finish()
    }
}

/// Shared state mutated only by the scheduler, after completions.
struct RunShared {
    context: RenderContext,
    results: BTreeMap<String, StepResult>,
}

fn lock(shared: &Mutex<RunShared>) -> MutexGuard<'_, RunShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Module execution engine.
///
/// Holds one loaded module definition and its runtime options.
#[derive(Debug, Clone)]
pub struct ModuleEngine {
    definition: Arc<ModuleDefinition>,
    options: OptionSet,
    source_path: Option<PathBuf>,
}

impl ModuleEngine {
    /// Loads a module file and seeds options from its defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let definition = load_module(path)?;
        let mut engine = Self::from_definition(definition);
        engine.source_path = Some(path.to_path_buf());
        Ok(engine)
    }

    /// Builds an engine from an already validated definition.
    pub fn from_definition(definition: ModuleDefinition) -> Self {
        let options = OptionSet::from_definition(&definition);
        Self {
            definition: Arc::new(definition),
            options,
            source_path: None,
        }
    }

    pub fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Sets a runtime option. Returns false for an undeclared name.
    pub fn update_option(&mut self, name: &str, value: impl Into<OptionValue>) -> bool {
        self.options.update_option(name, value)
    }

    /// Names of required options that are still unset.
    pub fn validate_options(&self) -> Vec<String> {
        self.options.validate_options()
    }

    /// Builds the initial render context for a run.
    fn seed_context(&self, run: &RunContext, project_path: &Path) -> RenderContext {
        let mut context = RenderContext::new();
        context.insert("date".into(), Value::String(Local::now().format("%Y-%m-%d").to_string()));
        context.insert(
            "tmp_dir".into(),
            Value::String(std::env::temp_dir().display().to_string()),
        );
        context.insert(
            "project_path".into(),
            Value::String(project_path.display().to_string()),
        );
        context.insert("module_id".into(), Value::String(self.definition.info.id.clone()));

        for (key, value) in run.globals() {
            context.insert(key.clone(), value.clone());
        }
        self.options.seed_context(&mut context, project_path);
        context
    }

    /// Runs every step and returns the results keyed by step name.
    ///
    /// Failed steps are reported through [`EngineError::StepsFailed`], or
    /// [`EngineError::Deadlock`] when they left dependents unable to run.
    /// Both carry the results of the steps that did complete.
    pub fn run(&self, run: &RunContext) -> Result<BTreeMap<String, StepResult>, EngineError> {
        let missing = self.validate_options();
        if !missing.is_empty() {
            return Err(EngineError::MissingVariable(missing));
        }

        let start_time = Instant::now();
        let project_path = run.project_path();
        fs::create_dir_all(&project_path)?;

        let context = self.seed_context(run, &project_path);
        let threads = thread_count(&context);
        let total = self.definition.len();

        info!(
            "Running module '{}' ({} steps, threads: {}, depth: {})",
            self.definition.info.id,
            total,
            threads,
            run.depth()
        );

        let executor = Arc::new(StepExecutor {
            definition: Arc::clone(&self.definition),
            module_dir: self
                .source_path
                .as_ref()
                .and_then(|p| p.parent())
                .map(Path::to_path_buf),
            project_path,
            run: run.clone(),
            parser: OutputParser::new(),
        });

        let shared = Mutex::new(RunShared {
            context,
            results: BTreeMap::new(),
        });

        let mut progress = ProgressReporter::for_run(total, run.is_background());
        if let Err(e) = progress.start() {
            warn!("Progress display unavailable: {}", e);
        }

        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();
        let mut state = ExecutionState::new(&self.definition);

        loop {
            for name in state.admit_ready(&self.definition, threads) {
                let Some(step) = self.definition.get_step(&name).cloned() else {
                    continue;
                };
                let snapshot = lock(&shared).context.clone();
                progress.set_tool(&step.label());
                info!("Starting step: {}", step.name);

                let tx = tx.clone();
                let executor = Arc::clone(&executor);
                let spawned = thread::Builder::new()
                    .name(format!("step-{}", step.name))
                    .spawn(move || {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            executor.execute(&step, &snapshot)
                        }))
                        .unwrap_or_else(|_| {
                            Err(EngineError::Worker(format!("step '{}' panicked", step.name)))
                        });

                        if let Err(e) = tx.send((step.name.clone(), result)) {
                            error!("Failed to send completion signal: {}", e);
                        }
                    });

                if let Err(e) = spawned {
                    progress.stop();
                    return Err(EngineError::Worker(format!(
                        "failed to start worker for step '{}': {}",
                        name, e
                    )));
                }
            }

            if state.is_finished() {
                break;
            }

            if state.is_deadlocked() {
                progress.stop();
                let err = EngineError::Deadlock {
                    failed: state.failed_names(),
                    blocked: state.blocked_names(),
                    failures: state.failures().to_vec(),
                    results: std::mem::take(&mut lock(&shared).results),
                };
                error!("{}", err);
                return Err(err);
            }

            let mut completions = Vec::new();
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(completion) => completions.push(completion),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    progress.stop();
                    return Err(EngineError::Worker("completion channel closed".to_string()));
                }
            }
            while let Ok(completion) = rx.try_recv() {
                completions.push(completion);
            }

            let mut guard = lock(&shared);
            for (name, result) in completions {
                match result {
                    Ok(result) => {
                        if result.skipped {
                            info!("Step '{}' skipped", name);
                        } else {
                            info!("Step '{}' completed", name);
                        }
                        guard.context.insert(name.clone(), result.context_entry());
                        guard.results.insert(name.clone(), result);
                        state.mark_completed(&name);
                    }
                    Err(e) => {
                        error!("Step '{}' failed: {}", name, e);
                        state.mark_failed(StepFailure {
                            step: name,
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            drop(guard);

            progress.update(state.finished_count());
        }

        progress.stop();
        info!(
            "Module '{}' finished in {:.2?}",
            self.definition.info.id,
            start_time.elapsed()
        );

        let shared = shared.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        let failures = state.into_failures();
        if !failures.is_empty() {
            return Err(EngineError::StepsFailed {
                failures,
                results: shared.results,
            });
        }

        Ok(shared.results)
    }
}

/// Worker count from the `threads` context value.
fn thread_count(context: &RenderContext) -> usize {
    let parsed = match context.get("threads") {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
        Some(Value::String(s)) => s.trim().parse::<usize>().ok(),
        _ => None,
    };
    parsed.unwrap_or(DEFAULT_THREADS).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{parse_module, StepDeclaration};
    use serde_json::json;
    use tempfile::tempdir;

    fn engine(yaml: &str) -> ModuleEngine {
        ModuleEngine::from_definition(parse_module(yaml, "inline").unwrap())
    }

    fn background(dir: &Path) -> RunContext {
        RunContext::new().with_project_path(dir).in_background()
    }

    #[test]
    fn test_echo_step_output() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: echo-test }
vars:
  msg: { type: string, default: test }
steps:
  - { name: step1, tool: echo, args: "{{msg}}" }
"#,
        );

        let results = engine.run(&background(dir.path())).unwrap();
        assert!(results["step1"].stdout.contains("test"));
        assert!(dir.path().join("echo-test/step1.txt").exists());
        assert!(dir.path().join("echo-test/step1.meta.json").exists());
    }

    #[test]
    fn test_missing_required_variable() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: scan }
vars:
  target: { type: string, required: true }
steps:
  - { name: s, tool: touch, args: marker }
"#,
        );

        let err = engine.run(&background(dir.path())).unwrap_err();
        assert!(matches!(err, EngineError::MissingVariable(ref names) if names == &vec!["target".to_string()]));
        assert!(!dir.path().join("marker").exists());
    }

    #[test]
    fn test_update_option_and_flag_rendering() {
        let dir = tempdir().unwrap();
        let mut engine = engine(
            r#"
type: module
info: { id: nmap }
vars:
  target: { type: string, required: true }
  service_scan: { type: boolean, default: false, flag: "-sV" }
steps:
  - { name: scan, tool: echo, args: "nmap {{service_scan}} {{target}}" }
"#,
        );

        assert!(engine.update_option("target", "example.com"));
        assert!(engine.update_option("service_scan", true));
        assert!(!engine.update_option("unknown", "x"));

        let results = engine.run(&background(dir.path())).unwrap();
        assert_eq!(results["scan"].stdout, "nmap -sV example.com\n");
        assert_eq!(results["scan"].command.as_deref(), Some("echo nmap -sV example.com"));
    }

    #[test]
    fn test_independent_steps_run_in_parallel() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: par }
steps:
  - { name: a, tool: sleep, args: "0.5" }
  - { name: b, tool: sleep, args: "0.5" }
  - { name: c, tool: echo, args: done, depends_on: [a, b] }
"#,
        );

        let start = Instant::now();
        let results = engine.run(&background(dir.path())).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 3);
        assert!(elapsed < Duration::from_millis(950), "took {:?}", elapsed);
    }

    #[test]
    fn test_exclusive_step_does_not_overlap() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: excl }
steps:
  - { name: a, tool: sleep, args: "0.3" }
  - { name: x, tool: sleep, args: "0.3", parallel: false }
  - { name: c, tool: sleep, args: "0.3" }
"#,
        );

        let start = Instant::now();
        engine.run(&background(dir.path())).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[test]
    fn test_dependency_sees_upstream_output() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: chain }
steps:
  - { name: first, tool: echo, args: alpha }
  - { name: second, tool: cat, args: "{{first.output}}", depends_on: first }
"#,
        );

        let results = engine.run(&background(dir.path())).unwrap();
        assert_eq!(results["second"].stdout, "alpha\n");
    }

    #[test]
    fn test_stdin_from_captured_dependencies() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: pipe }
steps:
  - { name: a, tool: printf, args: "'x\\ny\\n'", capture: true }
  - { name: b, tool: printf, args: "'y\\nz\\n'", capture: true }
  - { name: merged, tool: cat, stdin: true, depends_on: [a, b] }
"#,
        );

        let results = engine.run(&background(dir.path())).unwrap();
        assert_eq!(results["merged"].stdout, "x\ny\nz\n");
    }

    #[test]
    fn test_skipped_step_unblocks_dependents() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: skip }
vars:
  deep: { type: boolean, default: false }
steps:
  - { name: optional, tool: "false", condition: "{deep}" }
  - { name: after, tool: echo, args: "skipped={{optional.skipped}}", depends_on: optional }
"#,
        );

        let results = engine.run(&background(dir.path())).unwrap();
        assert!(results["optional"].skipped);
        assert_eq!(results["after"].stdout, "skipped=true\n");
    }

    #[test]
    fn test_cycle_reports_deadlock() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: cyc }
steps:
  - { name: a, tool: echo, depends_on: b }
  - { name: b, tool: echo, depends_on: a }
"#,
        );

        match engine.run(&background(dir.path())) {
            Err(EngineError::Deadlock { failed, blocked, .. }) => {
                assert!(failed.is_empty());
                assert_eq!(blocked, vec!["a", "b"]);
            }
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_dependency_reports_deadlock() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: fail }
steps:
  - { name: a, tool: "false" }
  - { name: b, tool: echo, args: never, depends_on: a }
"#,
        );

        match engine.run(&background(dir.path())) {
            Err(EngineError::Deadlock {
                failed,
                blocked,
                failures,
                results,
            }) => {
                assert_eq!(failed, vec!["a"]);
                assert_eq!(blocked, vec!["b"]);
                assert_eq!(failures[0].kind, "command-execution");
                assert!(results.is_empty());
            }
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_independent_failure_reports_steps_failed() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: partial }
steps:
  - { name: ok, tool: echo, args: fine }
  - { name: broken, tool: echo, args: "{{undefined_var}}" }
"#,
        );

        match engine.run(&background(dir.path())) {
            Err(EngineError::StepsFailed { failures, results }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].step, "broken");
                assert_eq!(failures[0].kind, "template");
                assert_eq!(results["ok"].stdout, "fine\n");
                assert!(!results.contains_key("broken"));
            }
            other => panic!("expected steps-failed, got {:?}", other),
        }
        assert!(dir.path().join("partial/ok.txt").exists());
    }

    #[test]
    fn test_deadlock_waits_for_running_branch() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: drain }
steps:
  - { name: a, tool: "false" }
  - { name: b, tool: echo, args: never, depends_on: a }
  - { name: slow, tool: sleep, args: "0.5" }
"#,
        );

        let start = Instant::now();
        match engine.run(&background(dir.path())) {
            Err(EngineError::Deadlock {
                failed,
                blocked,
                results,
                ..
            }) => {
                assert!(start.elapsed() >= Duration::from_millis(450));
                assert_eq!(failed, vec!["a"]);
                assert_eq!(blocked, vec!["b"]);
                assert_eq!(results["slow"].return_code, Some(0));
                assert!(!results.contains_key("b"));
            }
            other => panic!("expected deadlock, got {:?}", other),
        }
    }

    #[test]
    fn test_non_ascii_arguments() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: utf }
vars:
  word: { type: string, default: "naïve" }
steps:
  - { name: s, tool: echo, args: "héllo → {{word}} { -x {{missing}} || ünï }" }
"#,
        );

        let results = engine.run(&background(dir.path())).unwrap();
        assert_eq!(results["s"].stdout, "héllo → naïve ünï\n");
    }

    #[test]
    fn test_timeout_does_not_abort_run() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: slow }
steps:
  - { name: hang, tool: sleep, args: "5", timeout: 1 }
  - { name: next, tool: echo, args: after, depends_on: hang }
"#,
        );

        let start = Instant::now();
        let results = engine.run(&background(dir.path())).unwrap();
        assert!(results["hang"].timed_out);
        assert_eq!(results["next"].stdout, "after\n");
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_globals_and_seeded_values() {
        let dir = tempdir().unwrap();
        let engine = engine(
            r#"
type: module
info: { id: seeds }
steps:
  - { name: show, tool: echo, args: "{{module_id}} {{api_key}} {{date}}" }
"#,
        );

        let run = background(dir.path()).with_global("api_key", "k123");
        let results = engine.run(&run).unwrap();
        let today = Local::now().format("%Y-%m-%d").to_string();
        assert_eq!(results["show"].stdout, format!("seeds k123 {}\n", today));
    }

    #[test]
    fn test_submodule_step() {
        let dir = tempdir().unwrap();
        let modules = dir.path().join("mods");
        fs::create_dir_all(modules.join("modules")).unwrap();
        fs::write(
            modules.join("modules/child.yml"),
            r#"
type: module
info: { id: child }
vars:
  target: { type: string, required: true }
steps:
  - { name: greet, tool: echo, args: "hi {{target}}" }
"#,
        )
        .unwrap();
        let parent_path = modules.join("parent.yml");
        fs::write(
            &parent_path,
            r#"
type: module
info: { id: parent }
vars:
  target: { type: string, default: example.com }
steps:
  - { name: nested, module: child }
"#,
        )
        .unwrap();

        let project = dir.path().join("project");
        let engine = ModuleEngine::load(&parent_path).unwrap();
        let results = engine.run(&background(&project)).unwrap();

        let child: Value = serde_json::from_str(&results["nested"].stdout).unwrap();
        assert_eq!(child["greet"]["stdout"], json!("hi example.com\n"));
        assert!(project.join("child/greet.txt").exists());
    }

    #[test]
    fn test_submodule_via_resolver() {
        let dir = tempdir().unwrap();
        let child_path = dir.path().join("elsewhere.yml");
        fs::write(
            &child_path,
            "type: module\ninfo: { id: remote }\nsteps:\n  - { name: s, tool: echo, args: remote }\n",
        )
        .unwrap();

        let engine = ModuleEngine::from_definition(ModuleDefinition {
            steps: vec![StepDeclaration::module("nested", "registry/remote")],
            ..parse_module("type: module\ninfo: { id: host }\n", "inline").unwrap()
        });

        let target = child_path.clone();
        let resolver = move |reference: &str| (reference == "registry/remote").then(|| target.clone());
        let run = background(&dir.path().join("p")).with_resolver(Arc::new(resolver));

        let results = engine.run(&run).unwrap();
        assert!(results["nested"].stdout.contains("remote"));
    }

    #[test]
    fn test_self_referencing_module_hits_depth_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loop.yml");
        fs::write(
            &path,
            "type: module\ninfo: { id: loop }\nsteps:\n  - { name: again, module: loop.yml }\n",
        )
        .unwrap();

        let engine = ModuleEngine::load(&path).unwrap();
        let err = engine.run(&background(&dir.path().join("p"))).unwrap_err();
        assert!(err.to_string().contains("recursion-limit") || err.to_string().contains("nesting"));
    }

    #[test]
    fn test_thread_count() {
        let mut ctx = RenderContext::new();
        assert_eq!(thread_count(&ctx), DEFAULT_THREADS);
        ctx.insert("threads".into(), json!("3"));
        assert_eq!(thread_count(&ctx), 3);
        ctx.insert("threads".into(), json!(0));
        assert_eq!(thread_count(&ctx), 1);
        ctx.insert("threads".into(), json!("many"));
        assert_eq!(thread_count(&ctx), DEFAULT_THREADS);
    }
}
