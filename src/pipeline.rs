//! One invocation, start to finish.
//!
//! Stages: prepare the project directories, sanitize the prompt, look up the
//! continuation token, optionally augment with memories, fix the output
//! mode, build and launch the agent, then moderate, persist and close the
//! stream with exactly one terminal event. The caller holds the project's
//! lane for the whole run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::budget::{self, BudgetTracker, HttpBudgetTracker};
use crate::command::{AgentMode, BASE_ENV, CommandPlan, display_command, forward_env};
use crate::config::KilnConfig;
use crate::events::{AgentEvent, CompletedPayload, ErrorPayload, EventSink};
use crate::guardrails::{
    FileGuardrailConfig, GuardrailConfigProvider, HttpModerator, Moderator,
    OutputGuardrailConfig, OutputMode, OutputVerdict, moderate_output, sanitize,
};
use crate::launcher::{EventHandler, ExitKind, LaunchOutcome, launch};
use crate::memory::{self, HttpMemoryClient, MemoryService, MessagePair};
use crate::sandbox::ProjectPaths;
use crate::signals::MarkerGrammar;
use crate::store::{ProjectSession, SessionStore, TranscriptEntry, UsageRecord};
use crate::stream::{StreamParser, TextMode};

/// A request to run the agent once for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub project: String,
    pub prompt: String,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub model: Option<String>,
    /// Use long-term memory for this turn
    #[serde(default)]
    pub memory: bool,
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Run without touching session, transcript, usage or memory
    #[serde(default)]
    pub skip_persistence: bool,
}

impl ExecutionRequest {
    pub fn new(project: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            prompt: prompt.into(),
            mode: AgentMode::default(),
            model: None,
            memory: false,
            max_turns: None,
            skip_persistence: false,
        }
    }
}

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct Services {
    pub guardrails: Arc<dyn GuardrailConfigProvider>,
    pub moderator: Option<Arc<dyn Moderator>>,
    pub memory: Option<Arc<dyn MemoryService>>,
    pub budget: Option<Arc<dyn BudgetTracker>>,
}

impl Services {
    /// File-based guardrail settings and no HTTP collaborators.
    pub fn local(config: &KilnConfig) -> Self {
        Self {
            guardrails: Arc::new(FileGuardrailConfig::new(&config.workspace_dir)),
            moderator: None,
            memory: None,
            budget: None,
        }
    }

    /// HTTP collaborators for every endpoint configured.
    pub fn from_config(config: &KilnConfig) -> anyhow::Result<Self> {
        let mut services = Self::local(config);
        if let Some(url) = &config.moderation.url {
            let timeout = Duration::from_secs(config.moderation.timeout_secs);
            services.moderator = Some(Arc::new(HttpModerator::new(url, timeout)?));
        }
        if let Some(url) = &config.memory.url {
            let timeout = Duration::from_secs(config.memory.timeout_secs);
            services.memory = Some(Arc::new(HttpMemoryClient::new(url, timeout)?));
        }
        if let Some(url) = &config.budget.url {
            let timeout = Duration::from_secs(config.budget.timeout_secs);
            services.budget = Some(Arc::new(HttpBudgetTracker::new(url, timeout)?));
        }
        Ok(services)
    }
}

pub struct Pipeline {
    config: KilnConfig,
    grammar: Arc<MarkerGrammar>,
    store: SessionStore,
    services: Services,
    /// Detached collaborator calls (budget, memory store).
    background: TaskTracker,
}

impl Pipeline {
    pub fn new(config: KilnConfig, services: Services) -> Self {
        Self {
            grammar: Arc::new(config.grammar.clone()),
            store: SessionStore::new(&config.workspace_dir),
            config,
            services,
            background: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn background(&self) -> &TaskTracker {
        &self.background
    }

    /// Run one invocation and close `sink` with a terminal event.
    /// `on_exit` runs as soon as the agent process is gone, before
    /// moderation and persistence; aborting no longer applies after it.
    pub async fn run(
        &self,
        invocation: Uuid,
        request: ExecutionRequest,
        cancel: CancellationToken,
        sink: &mut EventSink,
        on_exit: impl FnOnce() + Send,
    ) {
        let started = Instant::now();
        let project = request.project.clone();

        if cancel.is_cancelled() {
            tracing::info!(project = %project, %invocation, "aborted before start");
            sink.emit(aborted_event(started)).await;
            return;
        }

        let paths = match ProjectPaths::resolve(&self.config.workspace_dir, &project) {
            Ok(paths) => paths,
            Err(e) => {
                sink.emit(AgentEvent::error(e.to_string())).await;
                return;
            }
        };
        if let Err(e) = paths.ensure_dirs().await {
            sink.emit(AgentEvent::error(e.to_string())).await;
            return;
        }

        // Pre-stage guardrails
        let detectors = match self.services.guardrails.input_config(&project).await {
            Ok(config) => config.detectors,
            Err(e) => {
                tracing::warn!(project = %project, error = %format!("{:#}", e), "failed to load input guardrails, skipping");
                Vec::new()
            }
        };
        let mut prompt = request.prompt.clone();
        if !detectors.is_empty() {
            let verdict = sanitize(&prompt, &detectors);
            if let Some(event) = verdict.event() {
                tracing::info!(project = %project, detectors = ?verdict.triggered, "input guardrails triggered");
                sink.emit(event).await;
            }
            prompt = verdict.sanitized;
        }

        let session = match self.store.read_session(&project).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(project = %project, error = %e, "failed to read session, starting fresh");
                None
            }
        };
        let session_token = session.map(|s| s.session_id);

        let mut agent_prompt = prompt.clone();
        if request.memory
            && session_token.is_none()
            && let Some(service) = &self.services.memory
        {
            agent_prompt = memory::augment_prompt(
                service.as_ref(),
                &project,
                &prompt,
                self.config.memory.search_limit,
            )
            .await;
        }

        let output_config = match self.services.guardrails.output_config(&project).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(project = %project, error = %format!("{:#}", e), "failed to load output guardrails, streaming live");
                OutputGuardrailConfig::default()
            }
        };
        let output_mode = OutputMode::resolve(&output_config, self.services.moderator.is_some());

        let plan = CommandPlan {
            agent_cmd: self.config.agent_cmd.clone(),
            sandbox_root: self.config.workspace_dir.clone(),
            working_dir: paths.root.clone(),
            config_dir: paths.agent_home.clone(),
            session_token: session_token.clone(),
            mode: request.mode,
            allowed_tools: self.config.allowed_tools.clone(),
            skip_permissions: self.config.skip_permissions,
            model: request.model.clone().or_else(|| self.config.default_model.clone()),
            max_turns: request.max_turns,
            prompt: agent_prompt,
            forwarded_env: forward_env(
                BASE_ENV
                    .iter()
                    .copied()
                    .chain(self.config.credentials.iter().map(String::as_str)),
                |name| std::env::var(name).ok(),
            ),
        };
        let command = match plan.build() {
            Ok(command) => command,
            Err(e) => {
                sink.emit(AgentEvent::error(e.to_string())).await;
                return;
            }
        };

        tracing::info!(
            project = %project,
            %invocation,
            mode = %request.mode,
            output = %output_mode,
            resume = session_token.is_some(),
            "starting agent"
        );
        tracing::debug!(command = %display_command(&command, &self.config.workspace_dir), "agent command");

        if cancel.is_cancelled() {
            sink.emit(aborted_event(started)).await;
            return;
        }

        let text_mode = match output_mode {
            OutputMode::Live => TextMode::Live,
            OutputMode::Moderated => TextMode::Held,
        };
        let mut parser = StreamParser::new(Arc::clone(&self.grammar), text_mode);
        let mut recorder = SessionRecorder {
            sink: &mut *sink,
            store: &self.store,
            project: &project,
            persist: !request.skip_persistence,
        };

        let launched = launch(
            &command,
            Some(&paths.root),
            self.config.timeout,
            &cancel,
            &mut parser,
            &mut recorder,
        )
        .await;
        on_exit();
        let outcome = match launched {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(project = %project, %invocation, error = %e, "failed to start agent");
                sink.emit(AgentEvent::error(e.to_string())).await;
                return;
            }
        };
        if matches!(outcome.exit, ExitKind::Aborted | ExitKind::TimedOut) {
            recorder.sink.stop_waiting();
        }
        for event in parser.finish() {
            recorder.handle(event).await;
        }

        // Post-stage moderation
        let response = match output_mode {
            OutputMode::Live => parser.response_text(),
            OutputMode::Moderated => {
                let held = parser.take_held();
                let (response, response_verdict) =
                    self.moderate(&project, held.response, &output_config).await;
                let (diagnostics, diagnostics_verdict) =
                    self.moderate(&project, held.diagnostics, &output_config).await;
                if let Some(event) = merge_verdicts(response_verdict, diagnostics_verdict)
                    .and_then(|verdict| verdict.event())
                {
                    tracing::info!(project = %project, "output guardrails triggered");
                    sink.emit(event).await;
                }
                sink.emit_all(parser.release(&response)).await;
                sink.emit_all(parser.release(&diagnostics)).await;
                response.trim_end().to_string()
            }
        };

        let usage = parser.usage().clone();
        let session_id = parser
            .session()
            .map(|s| s.session_id.clone())
            .or(session_token);

        if !request.skip_persistence {
            self.persist(&project, session_id.as_deref(), &prompt, &response, &usage)
                .await;
            if let Some(tracker) = &self.services.budget
                && !usage.is_empty()
            {
                budget::track_detached(
                    &self.background,
                    Arc::clone(tracker),
                    project.clone(),
                    &usage,
                );
            }
            if request.memory
                && outcome.exit == ExitKind::Exited(Some(0))
                && !response.trim().is_empty()
                && let Some(service) = &self.services.memory
            {
                let metadata = serde_json::json!({
                    "session_id": session_id,
                    "invocation": invocation.to_string(),
                });
                memory::store_detached(
                    &self.background,
                    Arc::clone(service),
                    project.clone(),
                    MessagePair {
                        user: prompt.clone(),
                        agent: response.clone(),
                    },
                    metadata,
                );
            }
        }

        let terminal = terminal_event(&outcome, &parser, session_id, usage);
        tracing::info!(
            project = %project,
            %invocation,
            outcome = terminal.kind(),
            duration_ms = outcome.duration.as_millis() as u64,
            "agent finished"
        );
        sink.emit(terminal).await;
    }

    /// Moderate one part of the held output. Empty text and moderator
    /// failures leave the text as it was.
    async fn moderate(
        &self,
        project: &str,
        text: String,
        config: &OutputGuardrailConfig,
    ) -> (String, Option<OutputVerdict>) {
        let Some(moderator) = &self.services.moderator else {
            return (text, None);
        };
        if text.trim().is_empty() {
            return (text, None);
        }
        match moderate_output(moderator.as_ref(), project, &text, config).await {
            Some(verdict) => (verdict.content.clone(), Some(verdict)),
            None => (text, None),
        }
    }

    async fn persist(
        &self,
        project: &str,
        session_id: Option<&str>,
        prompt: &str,
        response: &str,
        usage: &UsageRecord,
    ) {
        let cost = (!usage.is_empty()).then(|| usage.clone());
        let mut entries = vec![TranscriptEntry::user(prompt)];
        if !response.trim().is_empty() {
            entries.push(TranscriptEntry::agent(response, cost));
        }
        if let Err(e) = self.store.append_transcript(project, session_id, &entries).await {
            tracing::warn!(project, error = %e, "failed to append transcript");
        }
        if !usage.is_empty()
            && let Err(e) = self.store.record_usage(project, usage).await
        {
            tracing::warn!(project, error = %e, "failed to record usage");
        }
    }
}

/// Forwards events and writes the session on first sighting.
struct SessionRecorder<'a> {
    sink: &'a mut EventSink,
    store: &'a SessionStore,
    project: &'a str,
    persist: bool,
}

#[async_trait]
impl<'a> EventHandler for SessionRecorder<'a> {
    async fn handle(&mut self, event: AgentEvent) {
        if let AgentEvent::Session(payload) = &event
            && self.persist
        {
            let session = ProjectSession::new(payload.session_id.clone(), payload.model.clone());
            match self.store.write_session(self.project, &session).await {
                Ok(()) => tracing::debug!(project = self.project, session_id = %payload.session_id, "session saved"),
                Err(e) => tracing::warn!(project = self.project, error = %e, "failed to save session"),
            }
        }
        self.sink.emit(event).await;
    }
}

/// One verdict for the whole output: flagged if either part was.
fn merge_verdicts(a: Option<OutputVerdict>, b: Option<OutputVerdict>) -> Option<OutputVerdict> {
    match (a, b) {
        (Some(mut a), Some(b)) => {
            a.triggered |= b.triggered;
            a.duration_ms += b.duration_ms;
            for violation in b.violations {
                if !a.violations.contains(&violation) {
                    a.violations.push(violation);
                }
            }
            Some(a)
        }
        (a, b) => a.or(b),
    }
}

/// Terminal event for an invocation aborted before its agent started.
pub(crate) fn aborted_event(started: Instant) -> AgentEvent {
    AgentEvent::Completed(CompletedPayload {
        aborted: true,
        duration_ms: started.elapsed().as_millis() as u64,
        ..Default::default()
    })
}

fn terminal_event(
    outcome: &LaunchOutcome,
    parser: &StreamParser,
    session_id: Option<String>,
    usage: UsageRecord,
) -> AgentEvent {
    let usage = (!usage.is_empty()).then_some(usage);
    let duration_ms = outcome.duration.as_millis() as u64;
    match outcome.exit {
        ExitKind::Exited(Some(0)) => AgentEvent::Completed(CompletedPayload {
            exit_code: Some(0),
            session_id,
            usage,
            duration_ms,
            ..Default::default()
        }),
        ExitKind::Aborted => AgentEvent::Completed(CompletedPayload {
            session_id,
            usage,
            aborted: true,
            duration_ms,
            ..Default::default()
        }),
        ExitKind::TimedOut => AgentEvent::Completed(CompletedPayload {
            session_id,
            usage,
            timed_out: true,
            duration_ms,
            ..Default::default()
        }),
        ExitKind::Exited(code) => {
            let status = match code {
                Some(code) => format!("agent exited with code {}", code),
                None => "agent terminated by signal".to_string(),
            };
            let detail = parser
                .result_error()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| parser.stderr_tail());
            let message = if detail.is_empty() {
                status
            } else {
                format!("{}: {}", status, detail)
            };
            AgentEvent::Error(ErrorPayload {
                message,
                exit_code: code,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::ModerationResponse;
    use crate::memory::MemoryFact;
    use futures::StreamExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"claude-test"}"#;

    fn write_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Agent that reports a session, echoes its prompt and finishes.
    fn echo_agent(dir: &Path) -> PathBuf {
        write_agent(
            dir,
            &format!(
                r#"cat <<'EOF'
{INIT}
EOF
printf '%s\n' "$KILN_PROMPT"
cat <<'EOF'
{{"type":"result","subtype":"success","result":"ok","usage":{{"input_tokens":12,"output_tokens":3}},"total_cost_usd":0.01}}
EOF"#
            ),
        )
    }

    struct Fixture {
        _ws: tempfile::TempDir,
        _bin: tempfile::TempDir,
        workspace: PathBuf,
        agent: PathBuf,
    }

    fn fixture(agent_body: Option<&str>) -> Fixture {
        let ws = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let agent = match agent_body {
            Some(body) => write_agent(bin.path(), body),
            None => echo_agent(bin.path()),
        };
        Fixture {
            workspace: ws.path().to_path_buf(),
            _ws: ws,
            _bin: bin,
            agent,
        }
    }

    impl Fixture {
        fn config(&self) -> KilnConfig {
            let mut config = KilnConfig::for_workspace(self.workspace.clone()).unwrap();
            config.agent_cmd = self.agent.display().to_string();
            config
        }

        fn pipeline(&self) -> Pipeline {
            let config = self.config();
            let services = Services::local(&config);
            Pipeline::new(config, services)
        }

        fn write_guardrails(&self, project: &str, toml: &str) {
            let private = self.workspace.join(project).join(".kiln");
            std::fs::create_dir_all(&private).unwrap();
            std::fs::write(private.join("guardrails.toml"), toml).unwrap();
        }
    }

    async fn run(pipeline: &Pipeline, request: ExecutionRequest) -> Vec<AgentEvent> {
        run_with(pipeline, request, CancellationToken::new()).await
    }

    async fn run_with(
        pipeline: &Pipeline,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Vec<AgentEvent> {
        let id = Uuid::new_v4();
        let (mut sink, stream) = EventSink::channel(id);
        pipeline.run(id, request, cancel, &mut sink, || {}).await;
        drop(sink);
        stream.collect().await
    }

    fn stdout_text(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Stdout(p) => Some(p.text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn assert_single_terminal(events: &[AgentEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "events: {:?}", events);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_first_turn_persists_session_transcript_and_usage() {
        let fx = fixture(None);
        let pipeline = fx.pipeline();
        let events = run(&pipeline, ExecutionRequest::new("demo", "build it")).await;

        assert_single_terminal(&events);
        assert_eq!(events[0].kind(), "session");
        assert!(stdout_text(&events).contains("build it\n"));
        match events.last().unwrap() {
            AgentEvent::Completed(done) => {
                assert_eq!(done.exit_code, Some(0));
                assert_eq!(done.session_id.as_deref(), Some("sess-1"));
                assert_eq!(done.usage.as_ref().unwrap().input_tokens, 12);
                assert!(!done.aborted && !done.timed_out);
            }
            other => panic!("Expected Completed, got {:?}", other),
        }

        let store = pipeline.store();
        let session = store.read_session("demo").await.unwrap().unwrap();
        assert_eq!(session.session_id, "sess-1");
        assert_eq!(session.model.as_deref(), Some("claude-test"));

        let transcript = store.read_transcript("demo", None).await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].entry.message, "build it");
        assert_eq!(transcript[1].entry.message, "ok");
        assert_eq!(transcript[1].session_id.as_deref(), Some("sess-1"));

        let ledger = std::fs::read_to_string(fx.workspace.join("demo/.kiln/usage.jsonl")).unwrap();
        assert_eq!(ledger.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_second_turn_resumes_session() {
        let bin = tempfile::tempdir().unwrap();
        let args_file = bin.path().join("args.txt");
        let fx = fixture(Some(&format!(
            "printf '%s\\n' \"$@\" > '{}'\ncat <<'EOF'\n{}\nEOF",
            args_file.display(),
            INIT
        )));
        let pipeline = fx.pipeline();

        run(&pipeline, ExecutionRequest::new("demo", "first")).await;
        let first_args = std::fs::read_to_string(&args_file).unwrap();
        assert!(!first_args.contains("--resume"));

        run(&pipeline, ExecutionRequest::new("demo", "second")).await;
        let second_args = std::fs::read_to_string(&args_file).unwrap();
        assert!(second_args.contains("--resume\nsess-1\n"));
        assert!(second_args.ends_with("--print\nsecond\n"));
    }

    #[tokio::test]
    async fn test_skip_persistence_touches_nothing() {
        let fx = fixture(None);
        let pipeline = fx.pipeline();
        let mut request = ExecutionRequest::new("demo", "dry run");
        request.skip_persistence = true;
        let events = run(&pipeline, request).await;

        assert_single_terminal(&events);
        assert!(events.iter().any(|e| e.kind() == "session"));
        assert!(pipeline.store().read_session("demo").await.unwrap().is_none());
        assert!(pipeline.store().read_transcript("demo", None).await.unwrap().is_empty());
        assert!(!fx.workspace.join("demo/.kiln/usage.jsonl").exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_with_stderr() {
        let fx = fixture(Some("echo 'authentication failed' >&2\nexit 2"));
        let events = run(&fx.pipeline(), ExecutionRequest::new("demo", "hi")).await;

        assert_single_terminal(&events);
        match events.last().unwrap() {
            AgentEvent::Error(err) => {
                assert_eq!(err.exit_code, Some(2));
                assert!(err.message.contains("authentication failed"), "{}", err.message);
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_single_error() {
        let fx = fixture(None);
        let mut config = fx.config();
        config.agent_cmd = "/nonexistent/agent".into();
        let services = Services::local(&config);
        let events = run(&Pipeline::new(config, services), ExecutionRequest::new("demo", "hi")).await;

        // `sh` starts, `exec` of the missing agent fails with 127.
        assert_single_terminal(&events);
        match events.last().unwrap() {
            AgentEvent::Error(err) => assert_eq!(err.exit_code, Some(127)),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_input_guardrails_sanitize_prompt() {
        let fx = fixture(None);
        fx.write_guardrails("demo", "[input]\ndetectors = [\"email\", \"ip_address\"]\n");
        let events = run(
            &fx.pipeline(),
            ExecutionRequest::new("demo", "email me at a@b.com from 10.0.0.1"),
        )
        .await;

        match &events[0] {
            AgentEvent::GuardrailsTriggered(p) => {
                assert_eq!(p.detectors, vec!["email", "ip_address"]);
            }
            other => panic!("Expected GuardrailsTriggered, got {:?}", other),
        }
        let text = stdout_text(&events);
        assert!(!text.contains("a@b.com"));
        assert!(!text.contains("10.0.0.1"));
        assert!(text.contains("[REDACTED_EMAIL]"));
    }

    struct Rewriter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Moderator for Rewriter {
        async fn moderate(
            &self,
            _project: &str,
            content: &str,
            _config: &OutputGuardrailConfig,
        ) -> anyhow::Result<ModerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("moderator down");
            }
            Ok(ModerationResponse {
                triggered: content.contains("secret"),
                violations: vec!["confidential".into()],
                content: Some(content.replace("secret", "[removed]")),
            })
        }
    }

    fn moderated_pipeline(fx: &Fixture, fail: bool) -> (Pipeline, Arc<Rewriter>) {
        fx.write_guardrails("demo", "[output]\nenabled = true\n");
        let config = fx.config();
        let mut services = Services::local(&config);
        let moderator = Arc::new(Rewriter {
            calls: AtomicUsize::new(0),
            fail,
        });
        services.moderator = Some(moderator.clone());
        (Pipeline::new(config, services), moderator)
    }

    #[tokio::test]
    async fn test_post_moderation_rewrites_buffered_output() {
        let fx = fixture(Some(&format!(
            "cat <<'EOF'\n{}\nEOF\necho 'the secret plan'\nsleep 0.2\necho 'more text'",
            INIT
        )));
        let (pipeline, moderator) = moderated_pipeline(&fx, false);
        let events = run(&pipeline, ExecutionRequest::new("demo", "go")).await;

        assert_single_terminal(&events);
        assert_eq!(moderator.calls.load(Ordering::SeqCst), 1);
        let violation_at = events
            .iter()
            .position(|e| e.kind() == "output_guardrails_triggered")
            .expect("violation event");
        let first_stdout = events.iter().position(|e| e.kind() == "stdout").unwrap();
        assert!(violation_at < first_stdout);
        assert_eq!(
            events.iter().filter(|e| e.kind() == "output_guardrails_triggered").count(),
            1
        );
        assert_eq!(stdout_text(&events), "the [removed] plan\nmore text\n");

        let transcript = pipeline.store().read_transcript("demo", None).await.unwrap();
        assert_eq!(transcript[1].entry.message, "the [removed] plan\nmore text");
    }

    #[tokio::test]
    async fn test_post_moderation_failure_forwards_original() {
        let fx = fixture(Some("echo 'the secret plan'"));
        let (pipeline, _) = moderated_pipeline(&fx, true);
        let events = run(&pipeline, ExecutionRequest::new("demo", "go")).await;

        assert!(events.iter().all(|e| e.kind() != "output_guardrails_triggered"));
        assert_eq!(stdout_text(&events), "the secret plan\n");
    }

    #[tokio::test]
    async fn test_moderated_transcript_excludes_stderr() {
        let fx = fixture(Some(&format!(
            "cat <<'EOF'\n{}\n{}\nEOF\necho 'warning: deprecated flag' >&2",
            INIT,
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"the secret answer"}]}}"#
        )));
        let (pipeline, moderator) = moderated_pipeline(&fx, false);
        let events = run(&pipeline, ExecutionRequest::new("demo", "go")).await;

        assert_single_terminal(&events);
        assert_eq!(moderator.calls.load(Ordering::SeqCst), 2);
        let text = stdout_text(&events);
        assert!(text.starts_with("the [removed] answer"), "{}", text);
        assert!(text.contains("warning: deprecated flag\n"));

        let transcript = pipeline.store().read_transcript("demo", None).await.unwrap();
        assert_eq!(transcript[1].entry.message, "the [removed] answer");
    }

    #[derive(Default)]
    struct CountingMemory {
        searches: AtomicUsize,
        stored: Mutex<Vec<MessagePair>>,
    }

    #[async_trait]
    impl MemoryService for CountingMemory {
        async fn search(&self, _project: &str, _query: &str, _limit: usize) -> anyhow::Result<Vec<MemoryFact>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![MemoryFact {
                content: "the user prefers small commits".into(),
                score: None,
            }])
        }

        async fn store(&self, _project: &str, pair: &MessagePair, _metadata: &serde_json::Value) -> anyhow::Result<()> {
            self.stored.lock().unwrap().push(pair.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_memory_only_on_first_turn() {
        let fx = fixture(None);
        let config = fx.config();
        let mut services = Services::local(&config);
        let memory = Arc::new(CountingMemory::default());
        services.memory = Some(memory.clone());
        let pipeline = Pipeline::new(config, services);

        let mut request = ExecutionRequest::new("demo", "plan the release");
        request.memory = true;
        let first = run(&pipeline, request.clone()).await;
        assert!(stdout_text(&first).contains("prefers small commits"));

        let second = run(&pipeline, request).await;
        assert!(!stdout_text(&second).contains("prefers small commits"));
        assert_eq!(memory.searches.load(Ordering::SeqCst), 1);

        pipeline.background().close();
        pipeline.background().wait().await;
        let stored = memory.stored.lock().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].user, "plan the release");
    }

    #[tokio::test]
    async fn test_abort_before_start_never_spawns() {
        let bin = tempfile::tempdir().unwrap();
        let marker = bin.path().join("ran");
        let fx = fixture(Some(&format!("touch '{}'\necho hello", marker.display())));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events = run_with(&fx.pipeline(), ExecutionRequest::new("demo", "hi"), cancel).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::Completed(done) => assert!(done.aborted),
            other => panic!("Expected Completed, got {:?}", other),
        }
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_timeout_completes_with_flag() {
        let fx = fixture(Some("sleep 30"));
        let mut config = fx.config();
        config.timeout = Duration::from_millis(300);
        let services = Services::local(&config);
        let events = run(&Pipeline::new(config, services), ExecutionRequest::new("demo", "hi")).await;

        assert_single_terminal(&events);
        match events.last().unwrap() {
            AgentEvent::Completed(done) => {
                assert!(done.timed_out);
                assert!(!done.aborted);
            }
            other => panic!("Expected Completed, got {:?}", other),
        }
    }
}
