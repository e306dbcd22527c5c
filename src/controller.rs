//! Owns navigation state and sequences every remote operation.
//!
//! Remote work runs on worker threads. Results come back over a channel and
//! are applied only from [`SyncController::poll`] on the owning thread, so the
//! cursor, the channel phase and the current [`CancelToken`] are never touched
//! concurrently. Channel reads are tagged with the navigation generation and a
//! request id; anything that no longer matches is dropped without reaching the
//! render boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, TokenSource};
use crate::error::{ErrorContext, Operation, StoreError};
use crate::feed::FeedEvent;
use crate::model::{paths, Listing, NewPost, PatchOp, ReactionKind, ReactionOp};
use crate::render::RenderSink;
use crate::store::{DocumentStore, LiveFeed, Session};
use crate::thread::{reconstruct, ThreadEntry};
use crate::validation::{DocKind, Validator};

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn DocumentStore>,
    pub feed: Arc<dyn LiveFeed>,
    pub session: Arc<dyn Session>,
}

impl Services {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        feed: Arc<dyn LiveFeed>,
        session: Arc<dyn Session>,
    ) -> Self {
        Self {
            store,
            feed,
            session,
        }
    }

    /// One backend serving documents, the live feed and sessions.
    pub fn shared<T>(backend: Arc<T>) -> Self
    where
        T: DocumentStore + LiveFeed + Session + 'static,
    {
        let store: Arc<dyn DocumentStore> = backend.clone();
        let feed: Arc<dyn LiveFeed> = backend.clone();
        let session: Arc<dyn Session> = backend;
        Self::new(store, feed, session)
    }
}

/// What is currently open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub workspace: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPhase {
    Closed,
    Opening { channel: String },
    Open { channel: String },
    Refreshing { channel: String },
}

impl ChannelPhase {
    fn live_channel(&self) -> Option<&str> {
        match self {
            ChannelPhase::Open { channel } | ChannelPhase::Refreshing { channel } => Some(channel),
            ChannelPhase::Closed | ChannelPhase::Opening { .. } => None,
        }
    }
}

/// User-level request, one handler per variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Login {
        username: String,
    },
    Logout,
    RefreshWorkspaces,
    OpenWorkspace {
        workspace: String,
    },
    CloseWorkspace,
    OpenChannel {
        channel: String,
    },
    PostMessage {
        channel: String,
        body: String,
        parent: Option<String>,
    },
    ToggleReaction {
        op: ReactionOp,
        kind: ReactionKind,
        username: String,
        post: String,
    },
    CreateWorkspace {
        name: String,
    },
    DeleteWorkspace {
        workspace: String,
    },
    CreateChannel {
        workspace: String,
        name: String,
    },
    DeleteChannel {
        channel: String,
    },
    CancelSubscription,
}

struct PendingPosts {
    request_id: u64,
    channel: String,
    operation: Operation,
}

struct PendingWorkspace {
    request_id: u64,
    workspace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListingScope {
    Workspaces,
    Channels { workspace: String },
}

enum Response {
    Posts {
        request_id: u64,
        generation: u64,
        channel: String,
        result: Result<Vec<ThreadEntry>, StoreError>,
    },
    WorkspaceOpened {
        request_id: u64,
        generation: u64,
        workspace: String,
        result: Result<Vec<Listing>, StoreError>,
    },
    Listing {
        scope: ListingScope,
        context: ErrorContext,
        mutated: bool,
        result: Result<Vec<Listing>, StoreError>,
    },
    Feed {
        generation: u64,
        channel: String,
        event: FeedEvent,
    },
    FeedEnded {
        generation: u64,
        channel: String,
        result: Result<(), StoreError>,
    },
    ReactionApplied {
        post: String,
    },
    Authenticated {
        username: String,
    },
    LoggedOut,
    Failed {
        context: ErrorContext,
        error: StoreError,
    },
}

/// Decrements the in-flight job count when a worker finishes, even on panic.
struct JobGuard(Arc<AtomicUsize>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SyncController<S: RenderSink> {
    services: Services,
    validator: Arc<Validator>,
    sink: S,
    cursor: Cursor,
    phase: ChannelPhase,
    tokens: TokenSource,
    username: Option<String>,
    response_tx: Sender<Response>,
    response_rx: Receiver<Response>,
    next_request_id: u64,
    pending_posts: Option<PendingPosts>,
    pending_workspace: Option<PendingWorkspace>,
    in_flight: Arc<AtomicUsize>,
    reaction_lock: Arc<Mutex<()>>,
}

impl<S: RenderSink> SyncController<S> {
    pub fn new(services: Services, sink: S) -> Result<Self, StoreError> {
        let (response_tx, response_rx) = unbounded();
        Ok(Self {
            services,
            validator: Arc::new(Validator::new()?),
            sink,
            cursor: Cursor::default(),
            phase: ChannelPhase::Closed,
            tokens: TokenSource::new(),
            username: None,
            response_tx,
            response_rx,
            next_request_id: 1,
            pending_posts: None,
            pending_workspace: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            reaction_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn phase(&self) -> &ChannelPhase {
        &self.phase
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn current_generation(&self) -> u64 {
        self.tokens.current().generation()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// No worker is running and every result has been applied.
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.response_rx.is_empty()
    }

    pub fn dispatch(&mut self, intent: Intent) {
        match intent {
            Intent::Login { username } => self.login(&username),
            Intent::Logout => self.logout(),
            Intent::RefreshWorkspaces => self.refresh_workspaces(),
            Intent::OpenWorkspace { workspace } => self.open_workspace(&workspace),
            Intent::CloseWorkspace => self.close_workspace(),
            Intent::OpenChannel { channel } => self.open_channel(&channel),
            Intent::PostMessage {
                channel,
                body,
                parent,
            } => self.post_message(&channel, &body, parent.as_deref()),
            Intent::ToggleReaction {
                op,
                kind,
                username,
                post,
            } => self.toggle_reaction(op, kind, &username, &post),
            Intent::CreateWorkspace { name } => self.create_workspace(&name),
            Intent::DeleteWorkspace { workspace } => self.delete_workspace(&workspace),
            Intent::CreateChannel { workspace, name } => self.create_channel(&workspace, &name),
            Intent::DeleteChannel { channel } => self.delete_channel(&channel),
            Intent::CancelSubscription => self.cancel_current_subscription(),
        }
    }

    pub fn login(&mut self, username: &str) {
        if let Some(current) = &self.username {
            debug!(user = %current, "already logged in");
            return;
        }
        let username = username.trim().to_string();
        let session = Arc::clone(&self.services.session);
        self.spawn_job(move |tx| {
            let context = ErrorContext::new(Operation::Login, username.clone());
            match session.authenticate(&username) {
                Ok(()) => {
                    let _ = tx.send(Response::Authenticated { username });
                }
                Err(error) => {
                    let _ = tx.send(Response::Failed { context, error });
                }
            }
        });
    }

    pub fn logout(&mut self) {
        info!("logging out");
        self.invalidate_token();
        self.pending_workspace = None;
        self.close_channel_view();
        self.cursor = Cursor::default();
        self.username = None;

        let session = Arc::clone(&self.services.session);
        self.spawn_job(move |tx| {
            let response = match session.logout() {
                Ok(()) => Response::LoggedOut,
                Err(error) => Response::Failed {
                    context: ErrorContext::new(Operation::Logout, ""),
                    error,
                },
            };
            let _ = tx.send(response);
        });
    }

    pub fn refresh_workspaces(&mut self) {
        self.spawn_listing(
            ListingScope::Workspaces,
            ErrorContext::new(Operation::RefreshWorkspaces, paths::workspaces()),
            |_| Ok(()),
        );
    }

    pub fn open_workspace(&mut self, workspace: &str) {
        let workspace = paths::workspace(workspace);
        info!(workspace = %workspace, "opening workspace");
        self.invalidate_token();
        // The channel view stays on screen until the workspace actually opens.
        self.phase = ChannelPhase::Closed;

        let request_id = self.next_request_id();
        self.pending_workspace = Some(PendingWorkspace {
            request_id,
            workspace: workspace.clone(),
        });
        let generation = self.current_generation();
        let token = self.tokens.current().clone();
        let store = Arc::clone(&self.services.store);
        let validator = Arc::clone(&self.validator);
        self.spawn_job(move |tx| {
            let result = store
                .fetch_collection(&paths::channels(&workspace), &token)
                .and_then(|docs| validator.decode_listings(docs, DocKind::Channel));
            let _ = tx.send(Response::WorkspaceOpened {
                request_id,
                generation,
                workspace,
                result,
            });
        });
    }

    pub fn close_workspace(&mut self) {
        self.invalidate_token();
        self.pending_workspace = None;
        self.close_channel_view();
        self.cursor.workspace = None;
    }

    pub fn open_channel(&mut self, channel: &str) {
        info!(channel, "opening channel");
        self.invalidate_token();
        self.phase = ChannelPhase::Opening {
            channel: channel.to_string(),
        };
        self.fetch_posts(channel, Operation::OpenChannel);
    }

    pub fn post_message(&mut self, channel: &str, body: &str, parent: Option<&str>) {
        let channel = channel.to_string();
        let doc = NewPost::new(body, parent.map(str::to_string)).into_doc();
        let store = Arc::clone(&self.services.store);
        let reread = self.reread_target(&channel, Operation::PostMessage);
        let validator = Arc::clone(&self.validator);
        let token = self.tokens.current().clone();
        self.spawn_job(move |tx| {
            let context = ErrorContext::new(Operation::PostMessage, channel.clone());
            if let Err(error) = store.append_document(&paths::posts(&channel), &doc) {
                let _ = tx.send(Response::Failed { context, error });
            }
            if let Some((request_id, generation)) = reread {
                let result = load_thread(store.as_ref(), &validator, &channel, &token);
                let _ = tx.send(Response::Posts {
                    request_id,
                    generation,
                    channel,
                    result,
                });
            }
        });
    }

    pub fn toggle_reaction(&mut self, op: ReactionOp, kind: ReactionKind, username: &str, post: &str) {
        let post = post.to_string();
        let username = username.to_string();
        let store = Arc::clone(&self.services.store);
        let validator = Arc::clone(&self.validator);
        let lock = Arc::clone(&self.reaction_lock);
        self.spawn_job(move |tx| {
            // Serialized so the existence check and the initialization cannot interleave.
            let _guard = lock.lock();
            let result = store
                .fetch_document(&post)
                .and_then(|doc| validator.decode_post(doc))
                .and_then(|current| {
                    if current.doc.reactions.is_none() {
                        debug!(post = %post, "initializing reactions");
                        store.patch_document(&post, &[PatchOp::init_reactions()])?;
                    }
                    store.patch_document(&post, &[PatchOp::toggle(op, kind, &username)])
                });
            let response = match result {
                Ok(()) => Response::ReactionApplied { post },
                Err(error) => Response::Failed {
                    context: ErrorContext::new(Operation::ToggleReaction, post),
                    error,
                },
            };
            let _ = tx.send(response);
        });
    }

    pub fn create_workspace(&mut self, name: &str) {
        let workspace = paths::workspace(name);
        self.spawn_listing(
            ListingScope::Workspaces,
            ErrorContext::new(Operation::CreateWorkspace, workspace.clone()),
            move |store| {
                store.create_document(&workspace, &json!({}))?;
                store.create_collection(&paths::channels(&workspace))?;
                Ok(())
            },
        );
    }

    pub fn delete_workspace(&mut self, workspace: &str) {
        let workspace = paths::workspace(workspace);
        self.spawn_listing(
            ListingScope::Workspaces,
            ErrorContext::new(Operation::DeleteWorkspace, workspace.clone()),
            move |store| store.delete_document(&workspace),
        );
    }

    pub fn create_channel(&mut self, workspace: &str, name: &str) {
        let workspace = paths::workspace(workspace);
        let channel = paths::channel(&workspace, name);
        self.spawn_listing(
            ListingScope::Channels {
                workspace: workspace.clone(),
            },
            ErrorContext::new(Operation::CreateChannel, channel.clone()),
            move |store| {
                store.create_document(&channel, &json!({}))?;
                store.create_collection(&paths::posts(&channel))?;
                Ok(())
            },
        );
    }

    pub fn delete_channel(&mut self, channel: &str) {
        let context = ErrorContext::new(Operation::DeleteChannel, channel);
        let Some(workspace) = paths::workspace_of(channel) else {
            self.report(
                StoreError::NotFound {
                    path: channel.to_string(),
                },
                &context,
            );
            return;
        };
        let channel = channel.to_string();
        self.spawn_listing(
            ListingScope::Channels { workspace },
            context,
            move |store| store.delete_document(&channel),
        );
    }

    /// Invalidates the current token, aborting its live feed and in-flight
    /// reads. A channel that stays open is followed again under the fresh
    /// token; an open that had not completed falls back to the previous
    /// channel.
    pub fn cancel_current_subscription(&mut self) {
        self.invalidate_token();
        if !matches!(self.phase, ChannelPhase::Closed) {
            self.resume_previous_channel();
        }
    }

    fn invalidate_token(&mut self) {
        let previous = self.current_generation();
        self.tokens.advance();
        self.pending_posts = None;
        debug!(
            previous,
            current = self.current_generation(),
            "subscription cancelled"
        );
    }

    /// Applies every result that has already arrived.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_response(message);
            changed = true;
        }
        changed
    }

    /// Waits up to `timeout` for a result, then applies everything pending.
    pub fn poll_timeout(&mut self, timeout: Duration) -> bool {
        match self.response_rx.recv_timeout(timeout) {
            Ok(message) => {
                self.handle_response(message);
                self.poll();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Polls until no worker is running or `timeout` elapses.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if self.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.poll_timeout((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn spawn_job<F>(&self, job: F)
    where
        F: FnOnce(Sender<Response>) + Send + 'static,
    {
        let tx = self.response_tx.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = JobGuard(Arc::clone(&self.in_flight));
        thread::spawn(move || {
            let _guard = guard;
            job(tx);
        });
    }

    /// Runs `mutation`, then re-reads the listing it affected.
    fn spawn_listing<F>(&self, scope: ListingScope, context: ErrorContext, mutation: F)
    where
        F: FnOnce(&dyn DocumentStore) -> Result<(), StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.services.store);
        let validator = Arc::clone(&self.validator);
        let mutated = context.operation != Operation::RefreshWorkspaces;
        // Listings are not tied to navigation, so they never observe cancellation.
        let token = TokenSource::new().current().clone();
        self.spawn_job(move |tx| {
            if let Err(error) = mutation(store.as_ref()) {
                let _ = tx.send(Response::Failed { context, error });
                return;
            }
            let (path, kind) = match &scope {
                ListingScope::Workspaces => (paths::workspaces(), DocKind::Workspace),
                ListingScope::Channels { workspace } => (paths::channels(workspace), DocKind::Channel),
            };
            let result = store
                .fetch_collection(&path, &token)
                .and_then(|docs| validator.decode_listings(docs, kind));
            let _ = tx.send(Response::Listing {
                scope,
                context,
                mutated,
                result,
            });
        });
    }

    /// Registers a channel read as the latest one; an in-progress open stays an open.
    fn track_posts(&mut self, channel: &str, operation: Operation) -> (u64, u64) {
        let operation = match &self.pending_posts {
            Some(pending) if pending.channel == channel && pending.operation == Operation::OpenChannel => {
                Operation::OpenChannel
            }
            _ => operation,
        };
        let request_id = self.next_request_id();
        self.pending_posts = Some(PendingPosts {
            request_id,
            channel: channel.to_string(),
            operation,
        });
        (request_id, self.current_generation())
    }

    /// Tracks a follow-up read of `channel` if it is the channel on screen.
    fn reread_target(&mut self, channel: &str, operation: Operation) -> Option<(u64, u64)> {
        let opening = matches!(&self.phase, ChannelPhase::Opening { channel: opening } if opening == channel);
        if self.phase.live_channel() == Some(channel) {
            self.phase = ChannelPhase::Refreshing {
                channel: channel.to_string(),
            };
        } else if !opening {
            return None;
        }
        Some(self.track_posts(channel, operation))
    }

    fn fetch_posts(&mut self, channel: &str, operation: Operation) {
        let (request_id, generation) = self.track_posts(channel, operation);
        self.spawn_posts_read(channel, request_id, generation);
    }

    fn spawn_posts_read(&self, channel: &str, request_id: u64, generation: u64) {
        let channel = channel.to_string();
        let store = Arc::clone(&self.services.store);
        let validator = Arc::clone(&self.validator);
        let token = self.tokens.current().clone();
        self.spawn_job(move |tx| {
            let result = load_thread(store.as_ref(), &validator, &channel, &token);
            let _ = tx.send(Response::Posts {
                request_id,
                generation,
                channel,
                result,
            });
        });
    }

    fn refresh_channel(&mut self, channel: &str, operation: Operation) {
        if let Some((request_id, generation)) = self.reread_target(channel, operation) {
            self.spawn_posts_read(channel, request_id, generation);
        }
    }

    /// Follows `channel` on the live feed until `token` is cancelled. Each
    /// change re-reads the channel, as long as `token` is still current.
    pub fn subscribe(&self, channel: &str, token: &CancelToken) {
        let token = token.clone();
        let generation = token.generation();
        let channel = channel.to_string();
        let feed = Arc::clone(&self.services.feed);
        let tx = self.response_tx.clone();
        debug!(channel = %channel, generation, "starting live feed");
        thread::spawn(move || {
            let path = paths::posts(&channel);
            let result = feed.subscribe(&path, &token, &mut |event| {
                let _ = tx.send(Response::Feed {
                    generation,
                    channel: channel.clone(),
                    event,
                });
            });
            let _ = tx.send(Response::FeedEnded {
                generation,
                channel,
                result,
            });
        });
    }

    fn close_channel_view(&mut self) {
        self.phase = ChannelPhase::Closed;
        if let Some(channel) = self.cursor.channel.take() {
            self.sink.channel_closed(&channel);
        }
    }

    /// Brings the previously open channel back after a failed navigation.
    fn resume_previous_channel(&mut self) {
        self.phase = match self.cursor.channel.clone() {
            Some(channel) => {
                self.subscribe(&channel, self.tokens.current());
                ChannelPhase::Open { channel }
            }
            None => ChannelPhase::Closed,
        };
    }

    fn report(&mut self, error: StoreError, context: &ErrorContext) {
        if error.is_stale() {
            debug!(context = %context, "dropping stale result");
            return;
        }
        warn!(context = %context, code = error.code(), error = %error, "operation failed");
        self.sink.show_error(&error, context);
    }

    fn handle_response(&mut self, message: Response) {
        match message {
            Response::Posts {
                request_id,
                generation,
                channel,
                result,
            } => self.apply_posts(request_id, generation, channel, result),
            Response::WorkspaceOpened {
                request_id,
                generation,
                workspace,
                result,
            } => {
                let Some(pending) = &self.pending_workspace else {
                    return;
                };
                if pending.request_id != request_id
                    || pending.workspace != workspace
                    || !self.tokens.is_current(generation)
                {
                    debug!(workspace = %workspace, "dropping stale workspace listing");
                    return;
                }
                self.pending_workspace = None;
                match result {
                    Ok(channels) => {
                        self.close_channel_view();
                        self.cursor.workspace = Some(workspace.clone());
                        self.sink.show_channels(&workspace, &channels);
                    }
                    Err(error) => {
                        self.report(error, &ErrorContext::new(Operation::OpenWorkspace, workspace));
                        self.resume_previous_channel();
                    }
                }
            }
            Response::Listing {
                scope,
                context,
                mutated,
                result,
            } => self.apply_listing(scope, context, mutated, result),
            Response::Feed {
                generation,
                channel,
                event,
            } => {
                if !self.tokens.is_current(generation)
                    || self.phase.live_channel() != Some(channel.as_str())
                {
                    debug!(channel = %channel, generation, "dropping stale feed event");
                    return;
                }
                debug!(channel = %channel, path = event.path(), "live feed change");
                self.refresh_channel(&channel, Operation::RefreshChannel);
            }
            Response::FeedEnded {
                generation,
                channel,
                result,
            } => {
                if !self.tokens.is_current(generation) {
                    return;
                }
                match result {
                    Ok(()) => debug!(channel = %channel, "live feed ended"),
                    Err(error) => {
                        self.report(error, &ErrorContext::new(Operation::Subscribe, channel))
                    }
                }
            }
            Response::ReactionApplied { post } => {
                if let Some(channel) = paths::channel_of(&post) {
                    self.refresh_channel(&channel, Operation::ToggleReaction);
                }
            }
            Response::Authenticated { username } => {
                info!(user = %username, "logged in");
                self.username = Some(username);
                self.refresh_workspaces();
            }
            Response::LoggedOut => info!("logged out"),
            Response::Failed { context, error } => self.report(error, &context),
        }
    }

    fn apply_posts(
        &mut self,
        request_id: u64,
        generation: u64,
        channel: String,
        result: Result<Vec<ThreadEntry>, StoreError>,
    ) {
        let Some(pending) = &self.pending_posts else {
            debug!(channel = %channel, "dropping unrequested posts");
            return;
        };
        if pending.request_id != request_id
            || pending.channel != channel
            || !self.tokens.is_current(generation)
        {
            debug!(channel = %channel, request_id, generation, "dropping stale posts");
            return;
        }
        let operation = pending.operation;
        self.pending_posts = None;

        match (operation, result) {
            (Operation::OpenChannel, Ok(entries)) => {
                if let Some(workspace) = paths::workspace_of(&channel) {
                    self.cursor.workspace = Some(workspace);
                }
                if let Some(previous) = self.cursor.channel.replace(channel.clone()) {
                    if previous != channel {
                        self.sink.channel_closed(&previous);
                    }
                }
                self.phase = ChannelPhase::Open {
                    channel: channel.clone(),
                };
                self.sink.show_posts(&channel, &entries);
                self.subscribe(&channel, self.tokens.current());
            }
            (Operation::OpenChannel, Err(error)) => {
                self.report(error, &ErrorContext::new(Operation::OpenChannel, channel));
                self.resume_previous_channel();
            }
            (_, Ok(entries)) => {
                self.phase = ChannelPhase::Open {
                    channel: channel.clone(),
                };
                self.sink.show_posts(&channel, &entries);
            }
            (operation, Err(error)) => {
                self.phase = ChannelPhase::Open {
                    channel: channel.clone(),
                };
                self.report(error, &ErrorContext::new(operation, channel));
            }
        }
    }

    fn apply_listing(
        &mut self,
        scope: ListingScope,
        context: ErrorContext,
        mutated: bool,
        result: Result<Vec<Listing>, StoreError>,
    ) {
        if mutated {
            match context.operation {
                Operation::DeleteWorkspace
                    if self.cursor.workspace.as_deref() == Some(context.target.as_str()) =>
                {
                    info!(workspace = %context.target, "open workspace deleted");
                    self.close_workspace();
                }
                Operation::DeleteChannel
                    if self.cursor.channel.as_deref() == Some(context.target.as_str()) =>
                {
                    info!(channel = %context.target, "open channel deleted");
                    self.invalidate_token();
                    self.close_channel_view();
                }
                _ => {}
            }
        }

        match scope {
            ListingScope::Workspaces => match result {
                Ok(workspaces) => self.sink.show_workspaces(&workspaces),
                Err(error) => self.report(error, &context),
            },
            ListingScope::Channels { workspace } => {
                if self.cursor.workspace.as_deref() != Some(workspace.as_str()) {
                    debug!(workspace = %workspace, "dropping listing for a closed workspace");
                    return;
                }
                match result {
                    Ok(channels) => self.sink.show_channels(&workspace, &channels),
                    Err(error) => self.report(error, &context),
                }
            }
        }
    }
}

fn load_thread(
    store: &dyn DocumentStore,
    validator: &Validator,
    channel: &str,
    token: &CancelToken,
) -> Result<Vec<ThreadEntry>, StoreError> {
    let docs = store.fetch_collection(&paths::posts(channel), token)?;
    let posts = validator.decode_posts(docs)?;
    Ok(reconstruct(&posts))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentRef, PatchOp};
    use crate::store::MemoryStore;
    use serde_json::Value;
    use std::collections::HashMap;

    const GENERAL: &str = "/team/channels/general";
    const RANDOM: &str = "/team/channels/random";

    #[derive(Debug, Clone)]
    enum Shown {
        Posts {
            channel: String,
            entries: Vec<ThreadEntry>,
        },
        Workspaces(Vec<String>),
        Channels {
            workspace: String,
            names: Vec<String>,
        },
        Error {
            code: &'static str,
            context: ErrorContext,
        },
        Closed(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        shown: Vec<Shown>,
    }

    impl RecordingSink {
        fn threads(&self, channel: &str) -> Vec<Vec<(usize, String)>> {
            self.shown
                .iter()
                .filter_map(|shown| match shown {
                    Shown::Posts {
                        channel: shown_channel,
                        entries,
                    } if shown_channel == channel => Some(layout(entries)),
                    _ => None,
                })
                .collect()
        }

        fn last_entries(&self, channel: &str) -> Option<&[ThreadEntry]> {
            self.shown.iter().rev().find_map(|shown| match shown {
                Shown::Posts {
                    channel: shown_channel,
                    entries,
                } if shown_channel == channel => Some(entries.as_slice()),
                _ => None,
            })
        }

        fn last_thread(&self, channel: &str) -> Option<Vec<(usize, String)>> {
            self.last_entries(channel).map(layout)
        }

        fn last_workspaces(&self) -> Option<Vec<String>> {
            self.shown.iter().rev().find_map(|shown| match shown {
                Shown::Workspaces(names) => Some(names.clone()),
                _ => None,
            })
        }

        fn last_channels(&self, workspace: &str) -> Option<Vec<String>> {
            self.shown.iter().rev().find_map(|shown| match shown {
                Shown::Channels {
                    workspace: shown_workspace,
                    names,
                } if shown_workspace == workspace => Some(names.clone()),
                _ => None,
            })
        }

        fn errors(&self) -> Vec<(&'static str, Operation, String)> {
            self.shown
                .iter()
                .filter_map(|shown| match shown {
                    Shown::Error { code, context } => {
                        Some((*code, context.operation, context.target.clone()))
                    }
                    _ => None,
                })
                .collect()
        }

        fn closed(&self) -> Vec<String> {
            self.shown
                .iter()
                .filter_map(|shown| match shown {
                    Shown::Closed(channel) => Some(channel.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl RenderSink for RecordingSink {
        fn show_posts(&mut self, channel: &str, posts: &[ThreadEntry]) {
            self.shown.push(Shown::Posts {
                channel: channel.to_string(),
                entries: posts.to_vec(),
            });
        }

        fn show_workspaces(&mut self, workspaces: &[Listing]) {
            let names = workspaces.iter().map(|w| w.name().to_string()).collect();
            self.shown.push(Shown::Workspaces(names));
        }

        fn show_channels(&mut self, workspace: &str, channels: &[Listing]) {
            self.shown.push(Shown::Channels {
                workspace: workspace.to_string(),
                names: channels.iter().map(|c| c.name().to_string()).collect(),
            });
        }

        fn show_error(&mut self, error: &StoreError, context: &ErrorContext) {
            self.shown.push(Shown::Error {
                code: error.code(),
                context: context.clone(),
            });
        }

        fn channel_closed(&mut self, channel: &str) {
            self.shown.push(Shown::Closed(channel.to_string()));
        }
    }

    fn layout(entries: &[ThreadEntry]) -> Vec<(usize, String)> {
        entries
            .iter()
            .map(|entry| (entry.depth, entry.post.doc.msg.clone()))
            .collect()
    }

    /// Holds collection reads for gated paths until the test releases them.
    /// A released read resolves even when its token was cancelled.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        gates: Mutex<HashMap<String, Receiver<()>>>,
        resolved: Mutex<Vec<(String, bool)>>,
    }

    impl GatedStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                gates: Mutex::new(HashMap::new()),
                resolved: Mutex::new(Vec::new()),
            }
        }

        fn gate(&self, path: &str) -> Sender<()> {
            let (tx, rx) = unbounded();
            self.gates.lock().insert(path.to_string(), rx);
            tx
        }
    }

    impl DocumentStore for GatedStore {
        fn fetch_collection(&self, path: &str, cancel: &CancelToken) -> Result<Vec<Value>, StoreError> {
            let gate = self.gates.lock().remove(path);
            if let Some(gate) = gate {
                let _ = gate.recv();
                self.resolved
                    .lock()
                    .push((path.to_string(), cancel.is_cancelled()));
                let ignored = TokenSource::new();
                return self.inner.fetch_collection(path, ignored.current());
            }
            self.inner.fetch_collection(path, cancel)
        }

        fn fetch_document(&self, path: &str) -> Result<Value, StoreError> {
            self.inner.fetch_document(path)
        }

        fn create_document(&self, path: &str, body: &Value) -> Result<DocumentRef, StoreError> {
            self.inner.create_document(path, body)
        }

        fn create_collection(&self, path: &str) -> Result<DocumentRef, StoreError> {
            self.inner.create_collection(path)
        }

        fn append_document(&self, collection: &str, body: &Value) -> Result<DocumentRef, StoreError> {
            self.inner.append_document(collection, body)
        }

        fn patch_document(&self, path: &str, ops: &[PatchOp]) -> Result<(), StoreError> {
            self.inner.patch_document(path, ops)
        }

        fn delete_document(&self, path: &str) -> Result<(), StoreError> {
            self.inner.delete_document(path)
        }
    }

    impl LiveFeed for GatedStore {
        fn subscribe(
            &self,
            path: &str,
            cancel: &CancelToken,
            on_event: &mut dyn FnMut(FeedEvent),
        ) -> Result<(), StoreError> {
            self.inner.subscribe(path, cancel, on_event)
        }
    }

    impl Session for GatedStore {
        fn authenticate(&self, username: &str) -> Result<(), StoreError> {
            self.inner.authenticate(username)
        }

        fn logout(&self) -> Result<(), StoreError> {
            self.inner.logout()
        }
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.create_document("/team", &json!({})).unwrap();
        store.create_collection("/team/channels/").unwrap();
        for name in ["general", "random"] {
            let channel = paths::channel("/team", name);
            store.create_document(&channel, &json!({})).unwrap();
            store.create_collection(&paths::posts(&channel)).unwrap();
        }
        Arc::new(store)
    }

    fn add_post(store: &MemoryStore, channel: &str, msg: &str, parent: Option<&str>) -> String {
        let doc = NewPost::new(msg, parent.map(str::to_string)).into_doc();
        store
            .append_document(&paths::posts(channel), &doc)
            .unwrap()
            .uri
    }

    fn controller_for<T>(backend: Arc<T>) -> SyncController<RecordingSink>
    where
        T: DocumentStore + LiveFeed + Session + 'static,
    {
        SyncController::new(Services::shared(backend), RecordingSink::default()).unwrap()
    }

    fn wait_until<S: RenderSink>(
        controller: &mut SyncController<S>,
        mut done: impl FnMut(&SyncController<S>) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&*controller) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            controller.poll_timeout(Duration::from_millis(10));
        }
    }

    fn settle<S: RenderSink>(controller: &mut SyncController<S>) {
        assert!(controller.settle(Duration::from_secs(5)), "workers still running");
    }

    fn open(channel: &str) -> ChannelPhase {
        ChannelPhase::Open {
            channel: channel.to_string(),
        }
    }

    #[test]
    fn opening_a_channel_delivers_its_thread_and_subscribes() {
        let store = seeded_store();
        let root = add_post(&store, GENERAL, "hello", None);
        add_post(&store, GENERAL, "reply", Some(&root));
        add_post(&store, GENERAL, "another", None);

        let mut controller = controller_for(store.clone());
        controller.dispatch(Intent::OpenChannel {
            channel: GENERAL.into(),
        });
        assert_eq!(
            controller.phase(),
            &ChannelPhase::Opening {
                channel: GENERAL.into()
            }
        );
        settle(&mut controller);

        assert_eq!(
            controller.cursor(),
            &Cursor {
                workspace: Some("/team".into()),
                channel: Some(GENERAL.into()),
            }
        );
        assert_eq!(controller.phase(), &open(GENERAL));
        assert_eq!(
            controller.sink().threads(GENERAL),
            vec![vec![
                (0, "hello".to_string()),
                (1, "reply".to_string()),
                (0, "another".to_string()),
            ]]
        );
        wait_until(&mut controller, |_| store.subscriber_count() == 1);
    }

    #[test]
    fn newer_channel_open_supersedes_a_pending_one() {
        let store = seeded_store();
        add_post(&store, GENERAL, "in general", None);
        add_post(&store, RANDOM, "in random", None);
        let gated = Arc::new(GatedStore::new(store.clone()));
        let release = gated.gate(&paths::posts(GENERAL));

        let mut controller = controller_for(gated.clone());
        controller.open_channel(GENERAL);
        let first_generation = controller.current_generation();
        controller.open_channel(RANDOM);
        assert!(controller.current_generation() > first_generation);

        wait_until(&mut controller, |c| c.phase() == &open(RANDOM));
        release.send(()).unwrap();
        settle(&mut controller);

        assert!(controller.sink().threads(GENERAL).is_empty());
        assert_eq!(
            controller.sink().threads(RANDOM),
            vec![vec![(0, "in random".to_string())]]
        );
        assert_eq!(controller.cursor().channel.as_deref(), Some(RANDOM));
        assert_eq!(
            gated.resolved.lock().clone(),
            vec![(paths::posts(GENERAL), true)]
        );
        assert!(controller.sink().errors().is_empty());
    }

    #[test]
    fn cancelled_open_is_never_delivered() {
        let store = seeded_store();
        add_post(&store, GENERAL, "hello", None);
        let gated = Arc::new(GatedStore::new(store));
        let release = gated.gate(&paths::posts(GENERAL));

        let mut controller = controller_for(gated);
        controller.open_channel(GENERAL);
        controller.dispatch(Intent::CancelSubscription);
        assert_eq!(controller.phase(), &ChannelPhase::Closed);

        release.send(()).unwrap();
        settle(&mut controller);
        assert!(controller.sink().shown.is_empty());
        assert_eq!(controller.cursor(), &Cursor::default());
    }

    #[test]
    fn failed_open_keeps_the_previous_channel() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);
        wait_until(&mut controller, |_| store.subscriber_count() == 1);

        let missing = "/team/channels/missing";
        controller.open_channel(missing);
        settle(&mut controller);

        assert_eq!(
            controller.sink().errors(),
            vec![("not-found", Operation::OpenChannel, missing.to_string())]
        );
        assert_eq!(controller.cursor().channel.as_deref(), Some(GENERAL));
        assert_eq!(controller.phase(), &open(GENERAL));
        // Let the cancelled feed unregister before counting.
        std::thread::sleep(Duration::from_millis(100));
        wait_until(&mut controller, |_| store.subscriber_count() == 1);

        // The resumed feed still drives refreshes.
        add_post(&store, GENERAL, "still live", None);
        wait_until(&mut controller, |c| {
            c.sink().last_thread(GENERAL) == Some(vec![(0, "still live".to_string())])
        });
    }

    #[test]
    fn posting_rereads_the_open_channel() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);

        controller.dispatch(Intent::PostMessage {
            channel: GENERAL.into(),
            body: "first".into(),
            parent: None,
        });
        wait_until(&mut controller, |c| {
            c.sink().last_thread(GENERAL).map(|t| t.len()) == Some(1)
        });
        let root = controller.sink().last_entries(GENERAL).unwrap()[0]
            .post
            .path
            .clone();

        controller.post_message(GENERAL, "second", Some(&root));
        wait_until(&mut controller, |c| {
            c.sink().last_thread(GENERAL)
                == Some(vec![(0, "first".to_string()), (1, "second".to_string())])
        });
        settle(&mut controller);
        assert!(controller.sink().errors().is_empty());
    }

    #[test]
    fn posting_to_a_missing_channel_reports_the_channel() {
        let store = seeded_store();
        let mut controller = controller_for(store);
        let missing = "/team/channels/missing";
        controller.post_message(missing, "lost", None);
        settle(&mut controller);
        assert_eq!(
            controller.sink().errors(),
            vec![("not-found", Operation::PostMessage, missing.to_string())]
        );
    }

    #[test]
    fn live_feed_change_refreshes_the_channel() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);
        wait_until(&mut controller, |_| store.subscriber_count() == 1);

        add_post(&store, GENERAL, "from elsewhere", None);
        wait_until(&mut controller, |c| {
            c.sink().last_thread(GENERAL) == Some(vec![(0, "from elsewhere".to_string())])
        });
    }

    #[test]
    fn navigating_away_releases_the_feed() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);
        wait_until(&mut controller, |_| store.subscriber_count() == 1);

        controller.open_workspace("team");
        settle(&mut controller);
        wait_until(&mut controller, |_| store.subscriber_count() == 0);

        add_post(&store, GENERAL, "unseen", None);
        std::thread::sleep(Duration::from_millis(100));
        controller.poll();

        assert_eq!(controller.sink().threads(GENERAL).len(), 1);
        assert_eq!(controller.cursor().workspace.as_deref(), Some("/team"));
        assert_eq!(controller.cursor().channel, None);
        assert_eq!(controller.phase(), &ChannelPhase::Closed);
        assert_eq!(controller.sink().closed(), vec![GENERAL.to_string()]);
        assert_eq!(
            controller.sink().last_channels("/team"),
            Some(vec!["general".to_string(), "random".to_string()])
        );
    }

    #[test]
    fn reaction_initialization_happens_once() {
        let store = seeded_store();
        let post = store
            .append_document(&paths::posts(GENERAL), &json!({ "msg": "plain" }))
            .unwrap()
            .uri;

        let mut controller = controller_for(store.clone());
        controller.toggle_reaction(ReactionOp::Add, ReactionKind::Smile, "ana", &post);
        controller.toggle_reaction(ReactionOp::Add, ReactionKind::Smile, "ana", &post);
        settle(&mut controller);

        let log = store.patch_log();
        let count = |op: &str| log.iter().filter(|(_, patch)| patch.op == op).count();
        assert_eq!(count("ObjectAdd"), 1);
        assert_eq!(count("ArrayAdd"), 2);

        let doc = store.fetch_document(&post).unwrap();
        assert_eq!(doc["doc"]["reactions"]["smile"], json!(["ana"]));
        assert_eq!(doc["doc"]["reactions"]["frown"], json!([]));
    }

    #[test]
    fn feed_from_a_superseded_token_is_ignored() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);
        let old_token = controller.tokens.current().clone();
        controller.open_channel(RANDOM);
        settle(&mut controller);

        controller.subscribe(GENERAL, &old_token);
        add_post(&store, GENERAL, "ignored", None);
        std::thread::sleep(Duration::from_millis(100));
        controller.poll();
        assert_eq!(controller.sink().threads(GENERAL).len(), 1);
    }

    #[test]
    fn cancelling_keeps_following_the_open_channel() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);
        wait_until(&mut controller, |_| store.subscriber_count() == 1);
        let before = controller.current_generation();

        controller.dispatch(Intent::CancelSubscription);
        assert!(controller.current_generation() > before);
        assert_eq!(controller.phase(), &open(GENERAL));
        std::thread::sleep(Duration::from_millis(100));
        wait_until(&mut controller, |_| store.subscriber_count() == 1);

        add_post(&store, GENERAL, "after cancel", None);
        wait_until(&mut controller, |c| {
            c.sink().last_thread(GENERAL) == Some(vec![(0, "after cancel".to_string())])
        });
        assert!(controller.sink().errors().is_empty());
    }

    #[test]
    fn reaction_rereads_a_channel_named_like_its_posts() {
        let store = seeded_store();
        let channel = paths::channel("/team", "posts-2024");
        store.create_document(&channel, &json!({})).unwrap();
        store.create_collection(&paths::posts(&channel)).unwrap();
        let post = add_post(&store, &channel, "yearly recap", None);

        let mut controller = controller_for(store.clone());
        controller.open_channel(&channel);
        settle(&mut controller);
        assert_eq!(controller.sink().threads(&channel).len(), 1);
        // Detach the live feed so only the write-then-reread refreshes the view.
        controller.tokens.advance();
        wait_until(&mut controller, |_| store.subscriber_count() == 0);

        controller.toggle_reaction(ReactionOp::Add, ReactionKind::Celebrate, "bo", &post);
        settle(&mut controller);
        let reactions = controller.sink().last_entries(&channel).unwrap()[0]
            .post
            .doc
            .reactions
            .clone()
            .unwrap();
        assert!(reactions.contains(ReactionKind::Celebrate, "bo"));
        assert!(controller.sink().errors().is_empty());
    }

    #[test]
    fn channels_of_a_workspace_named_channels_can_be_deleted() {
        let store = MemoryStore::new();
        let workspace = paths::workspace("channels");
        let channel = paths::channel(&workspace, "general");
        assert_eq!(channel, "/channels/channels/general");
        store.create_document(&workspace, &json!({})).unwrap();
        store.create_collection(&paths::channels(&workspace)).unwrap();
        store.create_document(&channel, &json!({})).unwrap();
        store.create_collection(&paths::posts(&channel)).unwrap();
        let store = Arc::new(store);

        let mut controller = controller_for(store.clone());
        controller.open_channel(&channel);
        settle(&mut controller);
        assert_eq!(controller.cursor().workspace.as_deref(), Some("/channels"));

        controller.delete_channel(&channel);
        settle(&mut controller);
        assert!(controller.sink().errors().is_empty());
        assert_eq!(controller.cursor().channel, None);
        assert_eq!(controller.sink().closed(), vec![channel.clone()]);
        assert_eq!(controller.sink().last_channels("/channels"), Some(vec![]));
        let ignored = TokenSource::new();
        assert_eq!(
            store
                .fetch_document(&channel)
                .map_err(|err| err.code())
                .unwrap_err(),
            "not-found"
        );
        assert!(store
            .fetch_collection(&paths::channels(&workspace), ignored.current())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reaction_toggles_show_up_in_the_open_channel() {
        let store = seeded_store();
        let post = add_post(&store, GENERAL, "react to me", None);
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);

        let liked_by = |c: &SyncController<RecordingSink>, user: &str| {
            c.sink()
                .last_entries(GENERAL)
                .and_then(|entries| entries[0].post.doc.reactions.clone())
                .is_some_and(|reactions| reactions.contains(ReactionKind::Like, user))
        };

        controller.dispatch(Intent::ToggleReaction {
            op: ReactionOp::Add,
            kind: ReactionKind::Like,
            username: "ana".into(),
            post: post.clone(),
        });
        controller.toggle_reaction(ReactionOp::Add, ReactionKind::Like, "ana", &post);
        wait_until(&mut controller, |c| liked_by(c, "ana"));
        settle(&mut controller);
        let reactions = controller.sink().last_entries(GENERAL).unwrap()[0]
            .post
            .doc
            .reactions
            .clone()
            .unwrap();
        assert_eq!(reactions.count(ReactionKind::Like), 1);

        controller.toggle_reaction(ReactionOp::Remove, ReactionKind::Like, "ana", &post);
        wait_until(&mut controller, |c| !liked_by(c, "ana"));
    }

    #[test]
    fn reacting_to_a_missing_post_reports_it() {
        let store = seeded_store();
        let mut controller = controller_for(store);
        let missing = "/team/channels/general/posts/nope";
        controller.toggle_reaction(ReactionOp::Add, ReactionKind::Frown, "ana", missing);
        settle(&mut controller);
        assert_eq!(
            controller.sink().errors(),
            vec![("not-found", Operation::ToggleReaction, missing.to_string())]
        );
    }

    #[test]
    fn workspace_and_channel_crud_refresh_listings() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());

        controller.create_workspace("ops");
        settle(&mut controller);
        assert_eq!(
            controller.sink().last_workspaces(),
            Some(vec!["ops".to_string(), "team".to_string()])
        );

        controller.dispatch(Intent::CreateWorkspace { name: "ops".into() });
        settle(&mut controller);
        assert_eq!(
            controller.sink().errors(),
            vec![("conflict", Operation::CreateWorkspace, "/ops".to_string())]
        );

        controller.open_workspace("ops");
        settle(&mut controller);
        assert_eq!(controller.sink().last_channels("/ops"), Some(vec![]));

        controller.create_channel("ops", "alerts");
        settle(&mut controller);
        assert_eq!(
            controller.sink().last_channels("/ops"),
            Some(vec!["alerts".to_string()])
        );
        let ignored = TokenSource::new();
        assert!(store
            .fetch_collection(&paths::posts("/ops/channels/alerts"), ignored.current())
            .is_ok());

        // Listings for a workspace that is not open stay off screen.
        controller.create_channel("team", "dev");
        settle(&mut controller);
        assert_eq!(controller.sink().last_channels("/team"), None);

        controller.dispatch(Intent::DeleteChannel {
            channel: "/ops/channels/alerts".into(),
        });
        settle(&mut controller);
        assert_eq!(controller.sink().last_channels("/ops"), Some(vec![]));
    }

    #[test]
    fn deleting_the_open_channel_closes_it() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.open_channel(GENERAL);
        settle(&mut controller);
        wait_until(&mut controller, |_| store.subscriber_count() == 1);

        controller.delete_channel(GENERAL);
        settle(&mut controller);

        assert_eq!(controller.cursor().channel, None);
        assert_eq!(controller.cursor().workspace.as_deref(), Some("/team"));
        assert_eq!(controller.phase(), &ChannelPhase::Closed);
        assert_eq!(controller.sink().closed(), vec![GENERAL.to_string()]);
        assert_eq!(
            controller.sink().last_channels("/team"),
            Some(vec!["random".to_string()])
        );
        wait_until(&mut controller, |_| store.subscriber_count() == 0);
    }

    #[test]
    fn deleting_the_open_workspace_closes_it() {
        let store = seeded_store();
        let mut controller = controller_for(store);
        controller.open_channel(GENERAL);
        settle(&mut controller);

        controller.delete_workspace("/team");
        settle(&mut controller);
        assert_eq!(controller.cursor(), &Cursor::default());
        assert_eq!(controller.sink().last_workspaces(), Some(vec![]));
        assert_eq!(controller.sink().closed(), vec![GENERAL.to_string()]);
    }

    #[test]
    fn deleting_a_missing_workspace_reports_it() {
        let store = seeded_store();
        let mut controller = controller_for(store);
        controller.delete_workspace("ghost");
        settle(&mut controller);
        assert_eq!(
            controller.sink().errors(),
            vec![("not-found", Operation::DeleteWorkspace, "/ghost".to_string())]
        );
    }

    #[test]
    fn login_lists_workspaces_and_logout_resets_navigation() {
        let store = seeded_store();
        let mut controller = controller_for(store.clone());
        controller.dispatch(Intent::Login {
            username: "ana".into(),
        });
        settle(&mut controller);
        assert_eq!(controller.username(), Some("ana"));
        assert_eq!(store.current_user().as_deref(), Some("ana"));
        assert_eq!(
            controller.sink().last_workspaces(),
            Some(vec!["team".to_string()])
        );

        controller.open_channel(GENERAL);
        settle(&mut controller);
        controller.dispatch(Intent::Logout);
        settle(&mut controller);

        assert_eq!(controller.username(), None);
        assert_eq!(store.current_user(), None);
        assert_eq!(controller.cursor(), &Cursor::default());
        assert_eq!(controller.phase(), &ChannelPhase::Closed);
        wait_until(&mut controller, |_| store.subscriber_count() == 0);
    }

    #[test]
    fn blank_username_is_rejected() {
        let store = seeded_store();
        let mut controller = controller_for(store);
        controller.login("   ");
        settle(&mut controller);
        assert_eq!(controller.username(), None);
        assert_eq!(
            controller.sink().errors(),
            vec![("unauthorized", Operation::Login, String::new())]
        );
    }
}
