//! The per-rank server loop.
//!
//! Each rank runs one [ServerSession] on its own task. The session owns all statistics and group
//! state for that rank; everything else reaches it through channels.

use crate::app_state::{RankStatus, StatusBoard};
use crate::checkpoint::Checkpointer;
use crate::collective::{ControlEvent, RankGroup};
use crate::error::EnsembleError;
use crate::field::{FieldTable, Recorded};
use crate::metrics;
use crate::options::Options;
use crate::partition::{ceil_partition, PartitionPlan};
use crate::protocol::{DataMessage, HandshakeResponse, LauncherMessage};
use crate::simulation::{validate_launcher_message, SimulationTable};
use crate::transport::{ConnectionEvent, LauncherChannel};
use crate::types::SimulationStatus;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hashbrown::HashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{event, Level};

/// Rank 0 looks for silent groups this often.
pub const TIMEOUT_CHECK_PERIOD: Duration = Duration::from_secs(20);

/// Longest wait for any source before the loop runs its periodic checks again.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest wait for the launcher to answer a `simu_info` request.
pub const PARAMETER_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum delay before a failed `simu_info` request is repeated for the same group.
pub const PARAMETER_RETRY_PERIOD: Duration = Duration::from_secs(10);

/// How often the status board is refreshed while the loop is busy.
const PUBLISH_PERIOD: Duration = Duration::from_secs(1);

/// Channels feeding one rank.
#[derive(Debug)]
pub struct EventSources {
    /// Encoded data messages addressed to this rank.
    pub data: Option<mpsc::Receiver<Bytes>>,
    /// Handshakes. Rank 0 only.
    pub connections: Option<mpsc::Receiver<ConnectionEvent>>,
    /// Rank 0 only.
    pub launcher: Option<LauncherChannel>,
    /// Becomes true when the process is asked to stop.
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `sampling_size` groups finished.
    Completed,
    /// A `stop` command.
    Stopped,
    Signal,
    /// The data source closed.
    Disconnected,
}

/// What a rank did before its loop ended.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub rank: usize,
    pub reason: StopReason,
    pub status: RankStatus,
}

#[derive(Debug)]
enum Event {
    Launcher(LauncherMessage),
    Connection(ConnectionEvent),
    Data(Bytes),
    Control(ControlEvent),
}

enum Woken {
    Launcher(Option<LauncherMessage>),
    Connection(Option<ConnectionEvent>),
    Data(Option<Bytes>),
    Control(Option<ControlEvent>),
    /// True when the sender is gone.
    Shutdown(bool),
    Idle,
}

async fn recv_opt<T>(receiver: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_launcher(launcher: &mut Option<LauncherChannel>) -> Option<LauncherMessage> {
    match launcher {
        Some(launcher) => launcher.incoming.recv().await,
        None => std::future::pending().await,
    }
}

/// Takes one ready item. Forgets the receiver once it reports closed.
fn try_take<T>(receiver: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match receiver.as_mut()?.try_recv() {
        Ok(item) => Some(item),
        Err(mpsc::error::TryRecvError::Empty) => None,
        Err(mpsc::error::TryRecvError::Disconnected) => {
            *receiver = None;
            None
        }
    }
}

/// State and behaviour of one server rank.
#[derive(Debug)]
pub struct ServerSession {
    options: Arc<Options>,
    group: RankGroup,
    /// Data endpoints of every rank, returned in handshake responses.
    node_names: Vec<String>,
    fields: FieldTable,
    simulations: SimulationTable,
    plan: Option<PartitionPlan>,
    owned: Vec<usize>,
    checkpointer: Checkpointer,
    board: Option<StatusBoard>,
    status: RankStatus,
    /// Launcher messages that arrived while waiting for a parameter answer.
    pending_launcher: VecDeque<LauncherMessage>,
    to_launcher: Vec<LauncherMessage>,
    parameter_queries: HashMap<usize, Instant>,
    timeout_check_period: Duration,
    stop: Option<StopReason>,
    last_checkpoint: Instant,
    last_timeout_check: Instant,
    last_launcher_message: Instant,
    launcher_warned: bool,
    last_publish: Instant,
}

impl ServerSession {
    pub fn new(options: Arc<Options>, group: RankGroup, node_names: Vec<String>) -> Self {
        let now = Instant::now();
        let checkpointer = Checkpointer::new(&options.restart_dir, group.rank());
        Self {
            fields: FieldTable::new(options.clone()),
            options,
            group,
            node_names,
            simulations: SimulationTable::new(),
            plan: None,
            owned: Vec::new(),
            checkpointer,
            board: None,
            status: RankStatus::default(),
            pending_launcher: VecDeque::new(),
            to_launcher: Vec::new(),
            parameter_queries: HashMap::new(),
            timeout_check_period: TIMEOUT_CHECK_PERIOD,
            stop: None,
            last_checkpoint: now,
            last_timeout_check: now,
            last_launcher_message: now,
            launcher_warned: false,
            last_publish: now,
        }
    }

    /// Publishes progress to `board` as the loop runs.
    pub fn with_status_board(mut self, board: StatusBoard) -> Self {
        self.board = Some(board);
        self
    }

    pub fn with_timeout_check_period(mut self, period: Duration) -> Self {
        self.timeout_check_period = period;
        self
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn fields(&self) -> &FieldTable {
        &self.fields
    }

    pub fn simulations(&self) -> &SimulationTable {
        &self.simulations
    }

    pub fn plan(&self) -> Option<&PartitionPlan> {
        self.plan.as_ref()
    }

    /// Runs until `sampling_size` groups finish, a `stop` command, a signal or the data source
    /// closing. Takes a final checkpoint before returning.
    #[tracing::instrument(level = "INFO", skip_all, fields(rank = self.group.rank()))]
    pub async fn run(mut self, mut sources: EventSources) -> Result<RunSummary, EnsembleError> {
        if self.options.restart {
            self.checkpointer
                .restore(&mut self.fields, &mut self.simulations);
        }
        self.publish();
        event!(
            Level::INFO,
            ranks = self.group.size(),
            sampling_size = self.options.sampling_size,
            "server rank ready"
        );

        let reason = loop {
            if *sources.shutdown.borrow() {
                break StopReason::Signal;
            }
            self.periodic(Instant::now());

            let events = self.poll_sources(&mut sources);
            let idle = events.is_empty();
            for event in events {
                self.dispatch(event, &mut sources).await?;
            }
            if idle {
                if let Some(event) = self.wait(&mut sources).await {
                    self.dispatch(event, &mut sources).await?;
                }
            }
            self.flush_launcher(&mut sources);
            if let Some(reason) = self.stop_reason(&sources) {
                break reason;
            }
        };

        Ok(self.finish(reason, &mut sources))
    }

    /// Takes at most one ready event from each source, in priority order.
    fn poll_sources(&mut self, sources: &mut EventSources) -> Vec<Event> {
        let mut events = Vec::new();
        let launcher = match self.pending_launcher.pop_front() {
            Some(message) => Some(message),
            None => self.try_take_launcher(sources),
        };
        if let Some(message) = launcher {
            events.push(Event::Launcher(message));
        }
        if let Some(connection) = try_take(&mut sources.connections) {
            events.push(Event::Connection(connection));
        }
        if let Some(frame) = try_take(&mut sources.data) {
            events.push(Event::Data(frame));
        }
        if let Some(control) = self.group.try_recv() {
            events.push(Event::Control(control));
        }
        events
    }

    fn try_take_launcher(&mut self, sources: &mut EventSources) -> Option<LauncherMessage> {
        let launcher = sources.launcher.as_mut()?;
        match launcher.incoming.try_recv() {
            Ok(message) => Some(message),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                event!(Level::WARN, "launcher disconnected");
                sources.launcher = None;
                None
            }
        }
    }

    /// Waits for the first source to become ready, or `POLL_TIMEOUT`.
    async fn wait(&mut self, sources: &mut EventSources) -> Option<Event> {
        let woken = tokio::select! {
            message = recv_launcher(&mut sources.launcher) => Woken::Launcher(message),
            connection = recv_opt(&mut sources.connections) => Woken::Connection(connection),
            frame = recv_opt(&mut sources.data) => Woken::Data(frame),
            control = self.group.recv() => Woken::Control(control),
            changed = sources.shutdown.changed() => Woken::Shutdown(changed.is_err()),
            _ = tokio::time::sleep(POLL_TIMEOUT) => Woken::Idle,
        };
        match woken {
            Woken::Launcher(Some(message)) => Some(Event::Launcher(message)),
            Woken::Launcher(None) => {
                event!(Level::WARN, "launcher disconnected");
                sources.launcher = None;
                None
            }
            Woken::Connection(Some(connection)) => Some(Event::Connection(connection)),
            Woken::Connection(None) => {
                sources.connections = None;
                None
            }
            Woken::Data(Some(frame)) => Some(Event::Data(frame)),
            Woken::Data(None) => {
                sources.data = None;
                None
            }
            Woken::Control(Some(control)) => Some(Event::Control(control)),
            Woken::Control(None) => {
                self.group.close_inbox();
                None
            }
            Woken::Shutdown(closed) => {
                // A dropped sender also means the process is going away.
                if closed {
                    self.stop.get_or_insert(StopReason::Signal);
                }
                None
            }
            Woken::Idle => None,
        }
    }

    async fn dispatch(
        &mut self,
        event: Event,
        sources: &mut EventSources,
    ) -> Result<(), EnsembleError> {
        match event {
            Event::Launcher(message) => self.handle_launcher(message),
            Event::Connection(connection) => {
                self.handle_connection(connection);
                Ok(())
            }
            Event::Data(frame) => self.handle_data(frame, sources).await,
            Event::Control(control) => {
                self.handle_control(control);
                Ok(())
            }
        }
    }

    fn periodic(&mut self, now: Instant) {
        if self.group.is_root() {
            if now.saturating_duration_since(self.last_timeout_check) >= self.timeout_check_period
            {
                self.last_timeout_check = now;
                for simu_id in self
                    .simulations
                    .check_timeouts(now, self.options.timeout_simu())
                {
                    metrics::SIMULATION_TIMEOUTS.with_label_values(&[]).inc();
                    self.broadcast(ControlEvent::Timeout { simu_id });
                }
            }
            if !self.launcher_warned
                && now.saturating_duration_since(self.last_launcher_message)
                    > self.options.launcher_timeout()
            {
                event!(
                    Level::WARN,
                    seconds = self.options.launcher_timeout,
                    "no message from launcher"
                );
                self.launcher_warned = true;
                self.checkpoint(now);
            }
        }
        if now.saturating_duration_since(self.last_checkpoint) >= self.options.checkpoint_interval()
        {
            self.checkpoint(now);
        }
        if now.saturating_duration_since(self.last_publish) >= PUBLISH_PERIOD {
            self.publish();
        }
    }

    fn broadcast(&self, event: ControlEvent) {
        if let Err(error) = self.group.broadcast(event) {
            event!(Level::WARN, %error, "failed to relay control event");
        }
    }

    fn handle_launcher(&mut self, message: LauncherMessage) -> Result<(), EnsembleError> {
        self.last_launcher_message = Instant::now();
        self.launcher_warned = false;
        match &message {
            LauncherMessage::Timeout { simu_id: None } => {
                event!(Level::TRACE, "launcher heartbeat")
            }
            LauncherMessage::Stop => {
                event!(Level::INFO, "stop requested by launcher");
                self.broadcast(ControlEvent::Stop);
                self.stop = Some(StopReason::Stopped);
            }
            LauncherMessage::OptionsRequest => {
                let json = serde_json::to_string(self.options.as_ref())?;
                self.to_launcher.push(LauncherMessage::Options(json));
            }
            LauncherMessage::Job { .. }
            | LauncherMessage::Drop { .. }
            | LauncherMessage::SimuInfo { .. } => {
                if let Err(error) = validate_launcher_message(&message, &self.options) {
                    event!(Level::WARN, %error, "discarding launcher message");
                    return Ok(());
                }
                self.simulations.apply(&message);
                self.broadcast(ControlEvent::Launcher(message));
            }
            other => event!(Level::WARN, message = %other, "unexpected launcher message"),
        }
        Ok(())
    }

    /// Fixes the data layout from the first simulation; later ones must match it.
    fn set_layout(&mut self, client_sizes: &[usize]) -> Result<(), EnsembleError> {
        if client_sizes.is_empty() {
            return Err(EnsembleError::protocol("simulation declares no processes"));
        }
        if let Some(plan) = &self.plan {
            if plan.client_sizes() == client_sizes {
                return Ok(());
            }
            return Err(EnsembleError::protocol(format!(
                "simulation slices {client_sizes:?} differ from {:?}",
                plan.client_sizes()
            )));
        }
        let global: usize = client_sizes.iter().sum();
        let server_sizes = ceil_partition(global, self.group.size());
        let plan = PartitionPlan::build(global, &server_sizes, client_sizes)?;
        self.owned = plan.owned_client_ranks(self.group.rank());
        event!(
            Level::INFO,
            global,
            owned = ?self.owned,
            "data layout fixed"
        );
        self.plan = Some(plan);
        Ok(())
    }

    fn handle_connection(&mut self, connection: ConnectionEvent) {
        let ConnectionEvent { request, reply } = connection;
        if let Err(error) = self.set_layout(&request.client_sizes) {
            // Dropping the reply closes the simulation's connection.
            event!(Level::WARN, simu_id = request.simu_id, %error, "rejecting simulation");
            return;
        }
        self.broadcast(ControlEvent::Connection {
            client_sizes: request.client_sizes.clone(),
        });
        let response = HandshakeResponse {
            sobol: self.options.sobol_enabled(),
            learning: self.options.learning_mode,
            nb_parameters: self.options.nb_parameters,
            verbosity: self.options.verbosity,
            node_names: self.node_names.clone(),
        };
        if reply.send(response).is_err() {
            event!(
                Level::WARN,
                simu_id = request.simu_id,
                "simulation left before handshake reply"
            );
        }
    }

    fn handle_control(&mut self, control: ControlEvent) {
        match control {
            ControlEvent::Connection { client_sizes } => {
                if let Err(error) = self.set_layout(&client_sizes) {
                    event!(Level::WARN, %error, "ignoring relayed layout");
                }
            }
            ControlEvent::Launcher(message) => {
                self.simulations.apply(&message);
            }
            ControlEvent::Parameters {
                simu_id,
                parameters,
            } => self.simulations.set_parameters(simu_id, parameters),
            ControlEvent::Timeout { simu_id } => self.simulations.reset(simu_id),
            ControlEvent::Stop => {
                self.stop = Some(StopReason::Stopped);
            }
            ControlEvent::Converged { rank } if self.group.is_root() => {
                self.to_launcher.push(LauncherMessage::Converged { rank });
            }
            ControlEvent::Converged { rank } => {
                event!(Level::WARN, rank, "peer received a convergence report")
            }
        }
    }

    fn reject(&mut self, error: &EnsembleError) {
        self.status.rejected += 1;
        metrics::record_data_message(self.group.rank(), "rejected");
        event!(Level::WARN, %error, "discarding data message");
    }

    async fn handle_data(
        &mut self,
        frame: Bytes,
        sources: &mut EventSources,
    ) -> Result<(), EnsembleError> {
        let message = match DataMessage::decode(&frame, self.options.vectors_per_message()) {
            Ok(message) => message,
            Err(error) => {
                self.reject(&error);
                return Ok(());
            }
        };
        if self.plan.is_none() {
            // The layout broadcast may still be queued behind this message.
            while let Some(control) = self.group.try_recv() {
                self.handle_control(control);
            }
        }
        let expected = match &self.plan {
            Some(plan) => plan.received_count(self.group.rank(), message.client_rank),
            None => {
                self.reject(&EnsembleError::protocol("data arrived before any handshake"));
                return Ok(());
            }
        };
        let Some(expected) = expected else {
            self.reject(&EnsembleError::protocol(format!(
                "client rank {} has no data for server rank {}",
                message.client_rank,
                self.group.rank()
            )));
            return Ok(());
        };
        if self.simulations.is_dropped(message.simu_id) {
            self.status.ignored += 1;
            metrics::record_data_message(self.group.rank(), "ignored");
            event!(Level::DEBUG, simu_id = message.simu_id, "data for dropped simulation");
            return Ok(());
        }

        match self.fields.insert(&message, Some(expected)) {
            Err(error) => {
                self.reject(&error);
                return Ok(());
            }
            Ok(Recorded::Duplicate) => {
                self.status.duplicates += 1;
                metrics::record_data_message(self.group.rank(), "duplicate");
                event!(
                    Level::DEBUG,
                    simu_id = message.simu_id,
                    field = %message.field,
                    timestep = message.timestep,
                    "duplicate data message"
                );
                // A replay still shows the group is alive, and may complete one that was reset
                // or resubmitted after all its data had arrived.
                self.simulations.touch(message.simu_id, Instant::now());
            }
            Ok(Recorded::Updated) => {
                self.status.messages += 1;
                metrics::record_data_message(self.group.rank(), "updated");
                let now = Instant::now();
                self.simulations.touch(message.simu_id, now);
                if self.group.is_root() {
                    self.ensure_parameters(message.simu_id, now, sources).await;
                }
            }
        }
        if self.fields.check_simu_state(message.simu_id, &self.owned)
            && self.simulations.finish(message.simu_id)
        {
            self.group_finished();
        }
        Ok(())
    }

    /// Asks the launcher for the parameters of `simu_id` unless they are already known.
    async fn ensure_parameters(&mut self, simu_id: usize, now: Instant, sources: &mut EventSources) {
        if self.options.nb_parameters == 0
            || self
                .simulations
                .get(simu_id)
                .is_some_and(|record| record.parameters.is_some())
        {
            return;
        }
        if self
            .parameter_queries
            .get(&simu_id)
            .is_some_and(|last| now.saturating_duration_since(*last) < PARAMETER_RETRY_PERIOD)
        {
            return;
        }
        let Some(launcher) = sources.launcher.as_mut() else {
            return;
        };
        self.parameter_queries.insert(simu_id, now);
        if let Err(error) = launcher.send(LauncherMessage::SimuInfoRequest { simu_id }) {
            event!(Level::WARN, %error, "cannot query simulation parameters");
            return;
        }

        let deadline = tokio::time::Instant::now() + PARAMETER_QUERY_TIMEOUT;
        let mut disconnected = false;
        loop {
            match tokio::time::timeout_at(deadline, launcher.incoming.recv()).await {
                Ok(Some(answer @ LauncherMessage::SimuInfo { simu_id: id, .. })) if id == simu_id => {
                    self.last_launcher_message = Instant::now();
                    if let Err(error) = validate_launcher_message(&answer, &self.options) {
                        event!(Level::WARN, %error, "simulation parameters rejected, will retry");
                        break;
                    }
                    let LauncherMessage::SimuInfo { parameters, .. } = answer else {
                        break;
                    };
                    self.parameter_queries.remove(&simu_id);
                    self.simulations.set_parameters(simu_id, parameters.clone());
                    self.broadcast(ControlEvent::Parameters {
                        simu_id,
                        parameters,
                    });
                    break;
                }
                Ok(Some(other)) => {
                    self.last_launcher_message = Instant::now();
                    self.pending_launcher.push_back(other);
                }
                Ok(None) => {
                    disconnected = true;
                    break;
                }
                Err(_) => {
                    let error = EnsembleError::LauncherTimeout {
                        request: LauncherMessage::SimuInfoRequest { simu_id }.to_string(),
                        seconds: PARAMETER_QUERY_TIMEOUT.as_secs(),
                    };
                    event!(Level::WARN, %error, "simulation parameters unknown, will retry");
                    break;
                }
            }
        }
        if disconnected {
            event!(Level::WARN, "launcher disconnected");
            sources.launcher = None;
        }
    }

    fn group_finished(&mut self) {
        let Some(tolerance) = self.options.convergence_tolerance else {
            return;
        };
        if self.status.converged || !self.options.sobol_enabled() {
            return;
        }
        self.fields.update_confidence();
        if !self.fields.check_convergence(tolerance) {
            return;
        }
        self.status.converged = true;
        let rank = self.group.rank();
        event!(Level::INFO, tolerance, "sobol indices converged");
        if self.group.is_root() {
            self.to_launcher.push(LauncherMessage::Converged { rank });
        } else if let Err(error) = self.group.report(ControlEvent::Converged { rank }) {
            event!(Level::WARN, %error, "failed to report convergence");
        }
    }

    /// Sends queued messages to the launcher. Peers have no launcher and drop theirs.
    fn flush_launcher(&mut self, sources: &mut EventSources) {
        let mut messages = self.simulations.drain_outbox();
        messages.append(&mut self.to_launcher);
        if !self.group.is_root() {
            return;
        }
        let Some(launcher) = sources.launcher.as_ref() else {
            return;
        };
        for message in messages {
            if let Err(error) = launcher.send(message) {
                event!(Level::WARN, %error, "launcher unreachable");
                break;
            }
        }
    }

    fn stop_reason(&self, sources: &EventSources) -> Option<StopReason> {
        if self.stop.is_some() {
            return self.stop;
        }
        if self.simulations.count(SimulationStatus::Finished) >= self.options.sampling_size {
            return Some(StopReason::Completed);
        }
        // A rank whose slice is empty never receives data.
        if self.plan.is_some() && self.owned.is_empty() {
            return Some(StopReason::Completed);
        }
        if sources.data.is_none() {
            return Some(StopReason::Disconnected);
        }
        None
    }

    fn checkpoint(&mut self, now: Instant) {
        self.last_checkpoint = now;
        match self.checkpointer.save(&self.fields, &self.simulations) {
            Ok(_) => self.status.checkpoints += 1,
            Err(error) => event!(Level::ERROR, %error, "checkpoint failed"),
        }
    }

    fn refresh_status(&mut self) {
        self.status.not_started = self.simulations.count(SimulationStatus::NotStarted);
        self.status.running = self.simulations.count(SimulationStatus::Running);
        self.status.finished = self.simulations.count(SimulationStatus::Finished);
        self.status.dropped = self.simulations.count(SimulationStatus::Dropped);
        self.status.slots = self.fields.slots().count();
    }

    fn publish(&mut self) {
        self.last_publish = Instant::now();
        self.refresh_status();
        metrics::record_simulations(self.group.rank(), &self.simulations);
        if let Some(board) = &self.board {
            board.publish_rank(self.group.rank(), self.status.clone());
            if self.group.is_root() {
                board.publish_simulations(
                    self.simulations
                        .records()
                        .map(|(_, record)| record.clone())
                        .collect(),
                );
            }
        }
    }

    fn finish(mut self, reason: StopReason, sources: &mut EventSources) -> RunSummary {
        self.checkpoint(Instant::now());
        if self.group.is_root() && reason != StopReason::Stopped {
            self.to_launcher.push(LauncherMessage::Stop);
        }
        self.flush_launcher(sources);
        self.publish();
        event!(
            Level::INFO,
            ?reason,
            finished = self.status.finished,
            messages = self.status.messages,
            "server rank stopping"
        );
        RunSummary {
            rank: self.group.rank(),
            reason,
            status: self.status,
        }
    }
}
