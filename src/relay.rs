//! High level relay orchestration.
//!
//! Wires the cookie jar, durable state, upstream client, verification widget
//! and event handlers together, then keeps a controller session alive:
//! connect, announce pending work, recover, dispatch, and start over after a
//! close or a reload.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::challenges::core::{ReqwestUpstreamClient, UpstreamClientError, UpstreamHttpClient};
use crate::challenges::detectors::ChallengeDetector;
use crate::challenges::solvers::ResetKind;
use crate::config::{ConfigError, RelayConfig};
use crate::external_deps::captcha::{
	CapSolverProvider, CaptchaProvider, CaptchaWidget, DisabledWidget, TurnstileWidget,
};
use crate::modules::cookies::SessionCookieJar;
use crate::modules::events::{ConnectionEvent, EventDispatcher, EventHandler, RelayEvent};
use crate::modules::state::{CredentialStore, PendingQueue, StateStore, StoreError};
use crate::session::{
	Endpoints, PageRegistryExtractor, RecoveryOutcome, RegistrySource, RelayServices, Session,
};
use crate::transport::{Channel, CloseReason, FrameSender};

/// Result alias used across the orchestration layer.
pub type RelayResult<T> = Result<T, RelayError>;

/// High-level error surfaced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("state store error: {0}")]
	Store(#[from] StoreError),
	#[error("upstream client initialisation failed: {0}")]
	Client(#[from] UpstreamClientError),
}

/// How one controller session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
	/// A reset asked for a fresh session.
	Reload(ResetKind),
	/// The controller link went away.
	Closed(CloseReason),
	Shutdown,
}

/// Fluent builder for [`Relay`].
pub struct RelayBuilder {
	config: RelayConfig,
	client: Option<Arc<dyn UpstreamHttpClient>>,
	jar: Option<Arc<SessionCookieJar>>,
	store: Option<StateStore>,
	widget: Option<Arc<dyn TurnstileWidget>>,
	captcha_provider: Option<Arc<dyn CaptchaProvider>>,
	registry: Option<Arc<dyn RegistrySource>>,
	detector: Option<ChallengeDetector>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl RelayBuilder {
	pub fn new() -> Self {
		Self {
			config: RelayConfig::default(),
			client: None,
			jar: None,
			store: None,
			widget: None,
			captcha_provider: None,
			registry: None,
			detector: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: RelayConfig) -> Self {
		self.config = config;
		self
	}

	/// Replaces the reqwest client, e.g. with a test double.
	pub fn with_upstream_client(mut self, client: Arc<dyn UpstreamHttpClient>) -> Self {
		self.client = Some(client);
		self
	}

	/// Shares an existing cookie jar. A custom upstream client must use the
	/// same jar for readiness checks to see its cookies.
	pub fn with_cookie_jar(mut self, jar: Arc<SessionCookieJar>) -> Self {
		self.jar = Some(jar);
		self
	}

	/// Uses `store` instead of opening the configured state file.
	pub fn with_state_store(mut self, store: StateStore) -> Self {
		self.store = Some(store);
		self
	}

	pub fn with_widget(mut self, widget: Arc<dyn TurnstileWidget>) -> Self {
		self.widget = Some(widget);
		self
	}

	/// Solves verification through `provider` when no widget is supplied.
	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.captcha_provider = Some(provider);
		self
	}

	pub fn with_registry_source(mut self, registry: Arc<dyn RegistrySource>) -> Self {
		self.registry = Some(registry);
		self
	}

	pub fn with_detector(mut self, detector: ChallengeDetector) -> Self {
		self.detector = Some(detector);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> RelayResult<Relay> {
		let config = self.config;
		config.validate()?;

		let jar = self.jar.unwrap_or_else(|| Arc::new(SessionCookieJar::new()));
		let client: Arc<dyn UpstreamHttpClient> = match self.client {
			Some(client) => client,
			None => Arc::new(ReqwestUpstreamClient::new(jar.clone(), &config.default_headers())?),
		};
		let store = match self.store {
			Some(store) => store,
			None => StateStore::open(&config.state_path)?,
		};

		let provider = self.captcha_provider.or_else(|| {
			config
				.captcha_api_key
				.as_ref()
				.map(|key| Arc::new(CapSolverProvider::new(key.clone())) as Arc<dyn CaptchaProvider>)
		});
		let widget: Arc<dyn TurnstileWidget> = match (self.widget, provider) {
			(Some(widget), _) => widget,
			(None, Some(provider)) => {
				log::info!("verification tokens solved through {}", provider.name());
				Arc::new(CaptchaWidget::new(provider, config.upstream_origin.clone()))
			}
			(None, None) => {
				log::warn!("no verification widget configured; token exchange will time out");
				Arc::new(DisabledWidget)
			}
		};

		let mut events = EventDispatcher::with_logging();
		for handler in self.handlers {
			events.register_handler(handler);
		}

		let endpoints = Arc::new(Endpoints::new(
			config.upstream_origin.clone(),
			config.endpoints.clone(),
			config.api_version,
			client.clone(),
		));

		let services = RelayServices {
			client,
			jar,
			queue: PendingQueue::new(store.clone()),
			credentials: CredentialStore::new(store, config.credential_safety_margin),
			endpoints,
			detector: Arc::new(self.detector.unwrap_or_default()),
			widget,
			registry: self
				.registry
				.unwrap_or_else(|| Arc::new(PageRegistryExtractor::new())),
			events: Arc::new(events),
			config: Arc::new(config),
		};

		Ok(Relay {
			services: Arc::new(services),
		})
	}
}

impl Default for RelayBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main relay orchestrator.
pub struct Relay {
	services: Arc<RelayServices>,
}

impl Relay {
	/// Construct a relay from `config` with the default collaborators.
	pub fn new(config: RelayConfig) -> RelayResult<Self> {
		RelayBuilder::new().with_config(config).build()
	}

	/// Obtain a builder to customise the relay instance.
	pub fn builder() -> RelayBuilder {
		RelayBuilder::new()
	}

	pub fn config(&self) -> &RelayConfig {
		&self.services.config
	}

	pub fn services(&self) -> &Arc<RelayServices> {
		&self.services
	}

	/// Keeps a controller session alive until `shutdown` fires. A reload
	/// reconnects at once; a dropped or refused connection waits the
	/// reconnect delay first.
	pub async fn run(&self, shutdown: CancellationToken) -> RelayResult<()> {
		let url = self.services.config.controller_url.clone();
		let delay = self.services.config.reconnect_delay;

		while !shutdown.is_cancelled() {
			let end = match Channel::connect(&url).await {
				Ok(channel) => {
					self.connection_event(true, None);
					let end = self.run_session(channel, &shutdown).await;
					let detail = match &end {
						SessionEnd::Reload(kind) => format!("reload after {kind:?} reset"),
						SessionEnd::Closed(reason) => format!("{reason:?}"),
						SessionEnd::Shutdown => "shutdown".to_string(),
					};
					self.connection_event(false, Some(detail));
					end
				}
				Err(err) => {
					log::warn!("{err}");
					SessionEnd::Closed(CloseReason::Failed(err.to_string()))
				}
			};

			match end {
				SessionEnd::Shutdown => break,
				SessionEnd::Reload(_) => continue,
				SessionEnd::Closed(_) => {
					log::info!("reconnecting in {delay:?}");
					tokio::select! {
						_ = shutdown.cancelled() => break,
						_ = sleep(delay) => {}
					}
				}
			}
		}

		log::info!("relay stopped");
		Ok(())
	}

	/// Runs one session over an established channel.
	pub async fn run_session(&self, channel: Channel, shutdown: &CancellationToken) -> SessionEnd {
		let (frames, outbound) = FrameSender::channel();
		let session = Session::new(self.services.clone(), frames);
		let ctx = session.context().clone();
		let stop = ctx.stop_token();

		let shutdown_link = {
			let stop = stop.clone();
			let shutdown = shutdown.clone();
			tokio::spawn(async move {
				tokio::select! {
					_ = shutdown.cancelled() => stop.cancel(),
					_ = stop.cancelled() => {}
				}
			})
		};

		match session.send_handshake() {
			Ok(pending) if !pending.is_empty() => {
				log::info!("announced {} pending request(s)", pending.len());
			}
			Ok(_) => {}
			Err(err) => log::error!("failed to read pending queue for handshake: {err}"),
		}

		let background = {
			let session = session.clone();
			let stop = stop.clone();
			tokio::spawn(async move {
				session.prepare().await;
				let recovery = session.recovery();
				tokio::select! {
					_ = stop.cancelled() => {}
					result = recovery.run() => match result {
						Ok(RecoveryOutcome::NothingPending) => {}
						Ok(outcome) => log::info!("recovery finished: {outcome:?}"),
						Err(err) => log::error!("recovery failed: {err}"),
					},
				}
			})
		};

		let dispatcher = session.clone();
		let reason = channel
			.pump(outbound, stop, move |message| dispatcher.dispatch(message))
			.await;

		let cancelled = session.close();
		background.abort();
		shutdown_link.abort();
		if cancelled > 0 {
			log::info!("cancelled {cancelled} in-flight request(s)");
		}

		if let Some(kind) = ctx.reload_requested() {
			SessionEnd::Reload(kind)
		} else if shutdown.is_cancelled() {
			SessionEnd::Shutdown
		} else {
			SessionEnd::Closed(reason)
		}
	}

	fn connection_event(&self, connected: bool, detail: Option<String>) {
		self.services
			.events
			.dispatch(RelayEvent::Connection(ConnectionEvent {
				url: self.services.config.controller_url.clone(),
				connected,
				detail,
				timestamp: Utc::now(),
			}));
	}
}
