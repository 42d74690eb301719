//! Opportunity lifecycle + delivery engine: sweep, resolve, select, post,
//! schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use serde::Deserialize;
use sor_core::{normalize_row, Opportunity, DATE_POSTED_HEADER};
use sor_storage::{RecordStore, SheetTable, StoreError};
use sor_transport::{ChatId, ChatTransport, Markup};
use strsim::normalized_damerau_levenshtein;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sor-delivery";

/// Category match cut-off; tolerates casing, stray whitespace and small
/// typos without requiring exact equality.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;

pub const DEFAULT_FOOTER: &str = "\n\n🌐 Share this with your friends";

/// Scheduler wall-clock poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Slightly more than one minute, so consecutive polls can never observe the
/// same target minute twice and double-fire a trigger.
pub const TRIGGER_COOLDOWN: Duration = Duration::from_secs(61);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("catalog has no {0:?} column")]
    MissingColumn(&'static str),
}

/// One catalog row paired with its sheet position at read time. The position
/// is the row's write-back identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub position: u32,
    pub opportunity: Opportunity,
}

/// Blank padding rows keep their positions but never enter the catalog.
pub fn catalog_rows(table: &SheetTable) -> Vec<CatalogRow> {
    table
        .records()
        .filter(|(_, raw)| !raw.is_empty())
        .map(|(position, raw)| CatalogRow {
            position,
            opportunity: normalize_row(&raw),
        })
        .collect()
}

// --- category resolution ---

/// Normalized edit-distance ratio over trimmed, lower-cased strings:
/// 1.0 = identical, 0.0 = completely dissimilar.
pub fn category_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    normalized_damerau_levenshtein(&a, &b)
}

/// Rows whose category matches `requested` above `threshold`, in catalog
/// order. No match is an empty result, not an error.
pub fn resolve_category<'a>(
    rows: &'a [CatalogRow],
    requested: &str,
    threshold: f64,
) -> Vec<&'a CatalogRow> {
    rows.iter()
        .filter(|row| category_similarity(&row.opportunity.category, requested) >= threshold)
        .collect()
}

/// First eligible (unposted, unexpired) row for the category. Expiry is
/// checked here as well as in the sweeper, so a failed sweep write can never
/// leak an expired row into delivery.
pub fn select_next<'a>(
    rows: &'a [CatalogRow],
    requested: &str,
    threshold: f64,
    today: NaiveDate,
) -> Option<&'a CatalogRow> {
    resolve_category(rows, requested, threshold)
        .into_iter()
        .find(|row| !row.opportunity.posted && !row.opportunity.is_expired(today))
}

// --- expiration sweeping ---

/// A row the sweeper retired: `posted` went from false to true because its
/// deadline had passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptRow {
    pub position: u32,
    pub deadline: NaiveDate,
}

/// Retire every expired, unposted row, writing each back immediately so a
/// partial failure leaves the already-swept rows correct. Write failures are
/// logged and skipped; sweeping continues.
pub async fn sweep_expired(
    store: &dyn RecordStore,
    today: NaiveDate,
) -> Result<Vec<SweptRow>, DeliveryError> {
    let table = store.read_table().await?;
    let mut rows = catalog_rows(&table);
    Ok(sweep_rows(store, &table, &mut rows, today).await)
}

async fn sweep_rows(
    store: &dyn RecordStore,
    table: &SheetTable,
    rows: &mut [CatalogRow],
    today: NaiveDate,
) -> Vec<SweptRow> {
    let Some(posted_col) = table.column_index("Posted") else {
        warn!("catalog has no Posted column; sweep skipped");
        return Vec::new();
    };

    let mut swept = Vec::new();
    for row in rows.iter_mut() {
        if row.opportunity.posted || !row.opportunity.is_expired(today) {
            continue;
        }
        let deadline = row.opportunity.deadline.expect("expired rows have a deadline");
        match store.write_cell(row.position, posted_col, "TRUE").await {
            Ok(()) => {
                info!(position = row.position, %deadline, "expired row retired");
                row.opportunity.posted = true;
                swept.push(SweptRow {
                    position: row.position,
                    deadline,
                });
            }
            Err(err) => {
                warn!(position = row.position, %err, "failed to retire expired row; continuing");
            }
        }
    }
    swept
}

// --- message rendering ---

/// Render the outgoing message: title line, labeled optional lines, footer.
/// Every user-supplied field is Markdown-escaped before embedding.
pub fn render_message(opp: &Opportunity, footer: &str) -> String {
    use sor_transport::escape_markdown as esc;

    let mut parts = vec![format!("🎓 *{}*", esc(&opp.title))];
    if !opp.benefit.is_empty() {
        parts.push(format!("📌 *Benefit:* {}", esc(&opp.benefit)));
    }
    if !opp.criteria.is_empty() {
        parts.push(format!("📌 *Criteria:* {}", esc(&opp.criteria)));
    }
    if !opp.requirement.is_empty() {
        parts.push(format!("📌 *Requirement:* {}", esc(&opp.requirement)));
    }
    if !opp.deadline_text.is_empty() {
        parts.push(format!("⏳ *Deadline:* {}", esc(&opp.deadline_text)));
    }
    if !opp.link.is_empty() {
        parts.push(format!("\n🔗 Apply here: {}", esc(&opp.link)));
    }
    format!("{}{}", parts.join("\n"), footer)
}

// --- posting ---

/// Outcome of one delivery attempt for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// Sent and (when `recorded`) committed to the store. `recorded = false`
    /// is the posted-but-unrecorded condition: the message went out but the
    /// write-back failed, and the row needs manual reconciliation.
    Delivered {
        position: u32,
        title: String,
        recorded: bool,
    },
    /// Normal terminal state: nothing unposted and unexpired matched.
    NoneAvailable,
    /// The transport did not confirm the send; the row is left unposted so a
    /// later trigger retries the same row.
    SendFailed { position: u32, reason: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub similarity_threshold: f64,
    /// Fixed zone all dates and trigger times are evaluated in, independent
    /// of where the process runs.
    pub utc_offset: FixedOffset,
    pub footer: String,
    /// Category order used by `post_all`.
    pub category_order: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            utc_offset: FixedOffset::east_opt(3600).expect("one hour east is in range"),
            footer: DEFAULT_FOOTER.to_string(),
            category_order: vec![
                "nigeria".to_string(),
                "tech".to_string(),
                "international".to_string(),
            ],
        }
    }
}

/// Per-category result of a `post_all` run; one category failing never
/// aborts the others.
#[derive(Debug)]
pub struct CategoryReport {
    pub category: String,
    pub outcome: Result<PostOutcome, DeliveryError>,
}

/// The delivery pipeline. Every invocation, manual or scheduled, runs the
/// full sweep, resolve, select, deliver sequence under one internal lock, so
/// two triggers can never select the same row concurrently.
pub struct DeliveryEngine {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn ChatTransport>,
    config: EngineConfig,
    pipeline: Mutex<()>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn ChatTransport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            pipeline: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.config.utc_offset).date_naive()
    }

    /// Deliver the next eligible opportunity for `category` to `destination`.
    pub async fn post_next(
        &self,
        category: &str,
        destination: ChatId,
    ) -> Result<PostOutcome, DeliveryError> {
        let _guard = self.pipeline.lock().await;
        self.post_next_locked(category, destination).await
    }

    /// Deliver one opportunity per configured category, in order.
    pub async fn post_all(&self, destination: ChatId) -> Vec<CategoryReport> {
        let _guard = self.pipeline.lock().await;
        let categories = self.config.category_order.clone();
        let mut reports = Vec::with_capacity(categories.len());
        for category in categories {
            let outcome = self.post_next_locked(&category, destination).await;
            if let Err(err) = &outcome {
                warn!(%category, %err, "delivery run failed; remaining categories continue");
            }
            reports.push(CategoryReport { category, outcome });
        }
        reports
    }

    /// Run a sweep on its own, outside any delivery.
    pub async fn sweep_now(&self) -> Result<Vec<SweptRow>, DeliveryError> {
        let _guard = self.pipeline.lock().await;
        sweep_expired(self.store.as_ref(), self.today()).await
    }

    async fn post_next_locked(
        &self,
        category: &str,
        destination: ChatId,
    ) -> Result<PostOutcome, DeliveryError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("delivery", %run_id, category, destination);
        async {
            let today = self.today();
            let table = self.store.read_table().await?;
            let mut rows = catalog_rows(&table);
            sweep_rows(self.store.as_ref(), &table, &mut rows, today).await;

            let Some(selected) =
                select_next(&rows, category, self.config.similarity_threshold, today).cloned()
            else {
                info!("no eligible opportunity");
                return Ok(PostOutcome::NoneAvailable);
            };

            self.deliver_row(&table, &selected, destination, today).await
        }
        .instrument(span)
        .await
    }

    /// Send first; commit only after a confirmed send. The commit writes
    /// `Posted` and (when the column exists) `DatePosted` in one store call.
    /// Refuses to send when the catalog cannot record the post at all.
    async fn deliver_row(
        &self,
        table: &SheetTable,
        row: &CatalogRow,
        destination: ChatId,
        today: NaiveDate,
    ) -> Result<PostOutcome, DeliveryError> {
        let posted_col = table
            .column_index("Posted")
            .ok_or(DeliveryError::MissingColumn("Posted"))?;

        let text = render_message(&row.opportunity, &self.config.footer);
        if let Err(err) = self
            .transport
            .send_message(destination, &text, Markup::Markdown)
            .await
        {
            warn!(position = row.position, %err, "send failed; row left unposted");
            return Ok(PostOutcome::SendFailed {
                position: row.position,
                reason: err.to_string(),
            });
        }

        let mut writes = vec![(posted_col, "TRUE".to_string())];
        if let Some(date_col) = table.column_index(DATE_POSTED_HEADER) {
            writes.push((date_col, today.format("%Y-%m-%d").to_string()));
        }

        match self.store.write_row_cells(row.position, &writes).await {
            Ok(()) => {
                info!(position = row.position, title = %row.opportunity.title, "posted");
                Ok(PostOutcome::Delivered {
                    position: row.position,
                    title: row.opportunity.title.clone(),
                    recorded: true,
                })
            }
            Err(err) => {
                error!(
                    position = row.position,
                    category = %row.opportunity.category,
                    timestamp = %Utc::now(),
                    %err,
                    "posted in destination but not recorded; needs manual reconciliation"
                );
                Ok(PostOutcome::Delivered {
                    position: row.position,
                    title: row.opportunity.title.clone(),
                    recorded: false,
                })
            }
        }
    }
}

// --- scheduling ---

/// One named daily trigger: fire at `at` (HH:MM in the engine's fixed zone)
/// and run the pipeline for each binding, in order.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    pub at: String,
    pub deliveries: Vec<DeliveryBinding>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryBinding {
    pub category: String,
    pub destination: ChatId,
}

pub fn parse_hhmm(text: &str) -> Option<(u32, u32)> {
    let (hours, minutes) = text.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some((hours, minutes))
}

#[derive(Debug)]
struct TriggerRuntime {
    name: String,
    at: (u32, u32),
    deliveries: Vec<DeliveryBinding>,
    cooldown_until: Option<tokio::time::Instant>,
}

/// Wall-clock poll loop driving the daily triggers. Per-trigger state machine
/// is Idle -> Firing -> Cooldown(61s) -> Idle. A trigger whose exact minute
/// was missed entirely (delayed poll, paused process) stays skipped until the
/// next day; that is an accepted scheduling-precision limit.
pub struct Scheduler {
    engine: Arc<DeliveryEngine>,
    triggers: Vec<TriggerRuntime>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(engine: Arc<DeliveryEngine>, triggers: Vec<TriggerConfig>) -> anyhow::Result<Self> {
        let triggers = triggers
            .into_iter()
            .map(|config| {
                let at = parse_hhmm(&config.at).ok_or_else(|| {
                    anyhow::anyhow!("trigger {:?} has invalid time {:?}", config.name, config.at)
                })?;
                Ok(TriggerRuntime {
                    name: config.name,
                    at,
                    deliveries: config.deliveries,
                    cooldown_until: None,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { engine, triggers })
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(triggers = self.triggers.len(), "scheduler loop started");
        loop {
            ticker.tick().await;
            let now = Utc::now().with_timezone(&self.engine.config().utc_offset);
            self.tick_at(now).await;
        }
    }

    /// One poll step; separated from `run` so tests drive it with a chosen
    /// wall-clock reading.
    pub async fn tick_at(&mut self, now: DateTime<FixedOffset>) {
        let current = (now.hour(), now.minute());
        for index in 0..self.triggers.len() {
            let (due, name) = {
                let trigger = &self.triggers[index];
                let cooling = trigger
                    .cooldown_until
                    .is_some_and(|until| until > tokio::time::Instant::now());
                (!cooling && trigger.at == current, trigger.name.clone())
            };
            if !due {
                continue;
            }

            info!(trigger = %name, "trigger firing");
            let deliveries = self.triggers[index].deliveries.clone();
            for binding in deliveries {
                match self
                    .engine
                    .post_next(&binding.category, binding.destination)
                    .await
                {
                    Ok(outcome) => {
                        info!(trigger = %name, category = %binding.category, ?outcome, "trigger delivery finished");
                    }
                    Err(err) => {
                        warn!(trigger = %name, category = %binding.category, %err, "trigger delivery failed; retried at next trigger");
                    }
                }
            }
            self.triggers[index].cooldown_until =
                Some(tokio::time::Instant::now() + TRIGGER_COOLDOWN);
        }
    }
}
