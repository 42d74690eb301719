//! Bot assembly: configuration, startup checks, command loop, daemon wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use sor_core::REQUIRED_HEADERS;
use sor_delivery::{
    DeliveryBinding, DeliveryEngine, EngineConfig, PostOutcome, Scheduler, TriggerConfig,
    DEFAULT_SIMILARITY_THRESHOLD,
};
use sor_storage::{RecordStore, SheetsClient, SheetsConfig};
use sor_transport::{ChatId, ChatTransport, Markup, TelegramClient, TelegramConfig};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "sor-bot";

/// Long-poll timeout handed to `getUpdates`.
const UPDATE_POLL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub bot_token: String,
    /// Fallback destination for schedule entries that name none.
    pub default_destination: Option<ChatId>,
    pub spreadsheet_id: String,
    pub store_access_token: String,
    pub worksheet: String,
    pub schedule_path: PathBuf,
    pub utc_offset_minutes: i32,
    pub similarity_threshold: f64,
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self {
            bot_token: std::env::var("BOT_TOKEN").unwrap_or_default(),
            default_destination: std::env::var("GROUP_CHAT_ID")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            spreadsheet_id: std::env::var("SHEET_ID").unwrap_or_default(),
            store_access_token: std::env::var("SHEETS_ACCESS_TOKEN").unwrap_or_default(),
            worksheet: std::env::var("SHEET_WORKSHEET").unwrap_or_else(|_| "Sheet1".to_string()),
            schedule_path: std::env::var("SOR_SCHEDULE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("schedule.yaml")),
            utc_offset_minutes: std::env::var("SOR_UTC_OFFSET_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            similarity_threshold: std::env::var("SOR_SIMILARITY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
        }
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .with_context(|| format!("utc offset {} minutes out of range", self.utc_offset_minutes))
    }
}

// --- schedule file ---

/// On-disk schedule: named triggers plus the category order used by
/// `post_all` and `/postall`. Destinations may be omitted per delivery when
/// a default destination is configured.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleFile {
    pub triggers: Vec<ScheduleTrigger>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleTrigger {
    pub name: String,
    pub at: String,
    pub deliveries: Vec<ScheduleBinding>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleBinding {
    pub category: String,
    #[serde(default)]
    pub destination: Option<ChatId>,
}

impl ScheduleFile {
    /// The original single daily run: every category at 08:30 to the default
    /// destination.
    pub fn default_daily() -> Self {
        Self {
            triggers: vec![ScheduleTrigger {
                name: "daily".to_string(),
                at: "08:30".to_string(),
                deliveries: ["nigeria", "tech", "international"]
                    .into_iter()
                    .map(|category| ScheduleBinding {
                        category: category.to_string(),
                        destination: None,
                    })
                    .collect(),
            }],
            categories: vec![
                "nigeria".to_string(),
                "tech".to_string(),
                "international".to_string(),
            ],
        }
    }

    /// Fill omitted destinations from the default. Triggers left with no
    /// deliverable binding are dropped with a warning rather than failing
    /// the whole schedule.
    pub fn resolve(self, default_destination: Option<ChatId>) -> Vec<TriggerConfig> {
        self.triggers
            .into_iter()
            .filter_map(|trigger| {
                let deliveries: Vec<DeliveryBinding> = trigger
                    .deliveries
                    .into_iter()
                    .filter_map(|binding| {
                        match binding.destination.or(default_destination) {
                            Some(destination) => Some(DeliveryBinding {
                                category: binding.category,
                                destination,
                            }),
                            None => {
                                warn!(
                                    category = %binding.category,
                                    "schedule entry has no destination and no default is set; skipped"
                                );
                                None
                            }
                        }
                    })
                    .collect();
                if deliveries.is_empty() {
                    warn!(trigger = %trigger.name, "trigger has no deliverable entries; dropped");
                    return None;
                }
                Some(TriggerConfig {
                    name: trigger.name,
                    at: trigger.at,
                    deliveries,
                })
            })
            .collect()
    }
}

pub fn load_schedule(path: &Path) -> Result<ScheduleFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// --- startup checks ---

/// Verify the required header row and append any missing headers at the end
/// (non-destructive). Returns the final header list.
pub async fn verify_headers(store: &dyn RecordStore) -> Result<Vec<String>> {
    let table = store.read_table().await.context("reading header row")?;
    let mut headers = table.headers().to_vec();
    let missing: Vec<&str> = REQUIRED_HEADERS
        .iter()
        .copied()
        .filter(|required| table.column_index(required).is_none())
        .collect();
    if !missing.is_empty() {
        info!(?missing, "required headers absent; appending");
        for name in missing {
            let col = headers.len() as u32 + 1;
            store
                .append_header_cell(col, name)
                .await
                .with_context(|| format!("appending header {name:?}"))?;
            headers.push(name.to_string());
        }
    }
    debug!(?headers, "catalog headers verified");
    Ok(headers)
}

// --- commands ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    GetId,
    Post { category: Option<String> },
    PostAll,
    DebugInfo,
}

/// Parse a message into a bot command. Tolerates the `@botname` suffix
/// Telegram appends in groups; anything unrecognized is ignored.
pub fn parse_command(text: &str) -> Option<Command> {
    let mut tokens = text.split_whitespace();
    let head = tokens.next()?;
    let command = head.strip_prefix('/')?.split('@').next()?;
    match command {
        "start" => Some(Command::Start),
        "getid" => Some(Command::GetId),
        "post" => Some(Command::Post {
            category: tokens.next().map(|s| s.to_lowercase()),
        }),
        "postall" => Some(Command::PostAll),
        "debuginfo" => Some(Command::DebugInfo),
        _ => None,
    }
}

/// Foreground command loop: long-polls Telegram and feeds commands into the
/// shared delivery engine. Scheduled and manual deliveries serialize inside
/// the engine itself.
pub struct CommandLoop {
    telegram: Arc<TelegramClient>,
    engine: Arc<DeliveryEngine>,
    store: Arc<dyn RecordStore>,
}

impl CommandLoop {
    pub fn new(
        telegram: Arc<TelegramClient>,
        engine: Arc<DeliveryEngine>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            telegram,
            engine,
            store,
        }
    }

    pub async fn run(self) {
        let mut offset: i64 = 0;
        info!("command loop started");
        loop {
            match self.telegram.get_updates(offset + 1, UPDATE_POLL_SECS).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id);
                        let Some(message) = update.message else { continue };
                        let Some(text) = message.text.as_deref() else { continue };
                        if message.from.as_ref().is_some_and(|from| from.is_bot) {
                            continue;
                        }
                        let Some(command) = parse_command(text) else { continue };
                        self.handle(message.chat.id, &message.chat.chat_type, command)
                            .await;
                    }
                }
                Err(err) => {
                    warn!(%err, "polling updates failed; backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn handle(&self, chat: ChatId, chat_type: &str, command: Command) {
        match command {
            Command::Start => {
                self.reply(
                    chat,
                    "Bot active. Use /post <category> or /postall to deliver to this chat.",
                    Markup::Plain,
                )
                .await;
            }
            Command::GetId => {
                self.reply(
                    chat,
                    &format!("Chat ID: `{chat}`\nType: `{chat_type}`"),
                    Markup::Markdown,
                )
                .await;
            }
            Command::Post { category: None } => {
                self.reply(chat, "Usage: /post <category>", Markup::Plain).await;
            }
            Command::Post {
                category: Some(category),
            } => {
                self.report_outcome(chat, &category, self.engine.post_next(&category, chat).await)
                    .await;
            }
            Command::PostAll => {
                let reports = self.engine.post_all(chat).await;
                for report in reports {
                    self.report_outcome(chat, &report.category, report.outcome).await;
                }
                self.reply(chat, "✅ Done (attempted posting).", Markup::Plain).await;
            }
            Command::DebugInfo => {
                let summary = match self.store.read_table().await {
                    Ok(table) => format!(
                        "Headers: {}\nData rows: {}",
                        table.headers().join(", "),
                        table.rows().len()
                    ),
                    Err(err) => format!("Catalog unavailable: {err}"),
                };
                self.reply(chat, &summary, Markup::Plain).await;
            }
        }
    }

    /// Delivered rows already reached the chat; only the other outcomes need
    /// a user-visible reply, and "nothing left" must read differently from a
    /// send failure.
    async fn report_outcome(
        &self,
        chat: ChatId,
        category: &str,
        outcome: std::result::Result<PostOutcome, sor_delivery::DeliveryError>,
    ) {
        match outcome {
            Ok(PostOutcome::Delivered { .. }) => {}
            Ok(PostOutcome::NoneAvailable) => {
                self.reply(
                    chat,
                    &format!("⚠️ No more {category} opportunities available."),
                    Markup::Plain,
                )
                .await;
            }
            Ok(PostOutcome::SendFailed { reason, .. }) => {
                self.reply(
                    chat,
                    &format!("Delivery for {category} failed to send ({reason}); it will be retried."),
                    Markup::Plain,
                )
                .await;
            }
            Err(err) => {
                warn!(%category, %err, "on-demand delivery failed");
                self.reply(
                    chat,
                    &format!("Catalog unavailable for {category}; try again later."),
                    Markup::Plain,
                )
                .await;
            }
        }
    }

    async fn reply(&self, chat: ChatId, text: &str, markup: Markup) {
        if let Err(err) = self.telegram.send_message(chat, text, markup).await {
            warn!(%err, "reply failed");
        }
    }
}

// --- assembly ---

/// Everything a running process needs, built once from configuration.
/// Construction is the fatal gate: missing credentials refuse to initialize.
pub struct App {
    pub config: BotConfig,
    pub telegram: Arc<TelegramClient>,
    pub store: Arc<SheetsClient>,
    pub engine: Arc<DeliveryEngine>,
    pub triggers: Vec<TriggerConfig>,
    pub categories: Vec<String>,
}

impl App {
    pub fn from_config(config: BotConfig) -> Result<Self> {
        let telegram = Arc::new(TelegramClient::new(TelegramConfig {
            bot_token: config.bot_token.clone(),
            ..Default::default()
        })?);
        let store = Arc::new(SheetsClient::new(SheetsConfig {
            spreadsheet_id: config.spreadsheet_id.clone(),
            access_token: config.store_access_token.clone(),
            worksheet: config.worksheet.clone(),
            ..Default::default()
        })?);

        let schedule = match load_schedule(&config.schedule_path) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!(%err, "schedule file unavailable; using the default daily schedule");
                ScheduleFile::default_daily()
            }
        };
        let categories = if schedule.categories.is_empty() {
            ScheduleFile::default_daily().categories
        } else {
            schedule.categories.clone()
        };
        let triggers = schedule.resolve(config.default_destination);

        let engine = Arc::new(DeliveryEngine::new(
            store.clone(),
            telegram.clone(),
            EngineConfig {
                similarity_threshold: config.similarity_threshold,
                utc_offset: config.utc_offset()?,
                category_order: categories.clone(),
                ..Default::default()
            },
        ));

        Ok(Self {
            config,
            telegram,
            store,
            engine,
            triggers,
            categories,
        })
    }

    /// Run the daemon: startup checks, background scheduler, foreground
    /// command loop.
    pub async fn run(self) -> Result<()> {
        let me = self
            .telegram
            .get_me()
            .await
            .context("verifying bot credentials")?;
        info!(bot = %me.username.as_deref().unwrap_or(&me.first_name), "transport ready");

        let headers = verify_headers(self.store.as_ref()).await?;
        info!(columns = headers.len(), "catalog ready");
        if let Ok(table) = self.store.read_table().await {
            for (position, raw) in table.records().take(3) {
                debug!(position, title = raw.get("Title"), "sample row");
            }
        }

        if self.triggers.is_empty() {
            warn!("no schedule triggers configured; running commands only");
        } else {
            let scheduler = Scheduler::new(self.engine.clone(), self.triggers.clone())?;
            tokio::spawn(scheduler.run());
        }

        CommandLoop::new(self.telegram.clone(), self.engine.clone(), self.store.clone())
            .run()
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_with_args_and_bot_suffix() {
        assert_eq!(parse_command("/start"), Some(Command::Start));
        assert_eq!(parse_command("/getid@sor_bot"), Some(Command::GetId));
        assert_eq!(
            parse_command("/post Nigeria"),
            Some(Command::Post {
                category: Some("nigeria".into())
            })
        );
        assert_eq!(
            parse_command("/post"),
            Some(Command::Post { category: None })
        );
        assert_eq!(parse_command("/postall@sor_bot extra"), Some(Command::PostAll));
        assert_eq!(parse_command("/debuginfo"), Some(Command::DebugInfo));
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command("/unknown"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn schedule_resolution_fills_default_destination() {
        let schedule = ScheduleFile {
            triggers: vec![ScheduleTrigger {
                name: "morning".into(),
                at: "08:30".into(),
                deliveries: vec![
                    ScheduleBinding {
                        category: "nigeria".into(),
                        destination: None,
                    },
                    ScheduleBinding {
                        category: "tech".into(),
                        destination: Some(-42),
                    },
                ],
            }],
            categories: vec![],
        };
        let triggers = schedule.resolve(Some(-100));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].deliveries[0].destination, -100);
        assert_eq!(triggers[0].deliveries[1].destination, -42);
    }

    #[test]
    fn unresolvable_trigger_is_dropped_not_fatal() {
        let schedule = ScheduleFile {
            triggers: vec![ScheduleTrigger {
                name: "morning".into(),
                at: "08:30".into(),
                deliveries: vec![ScheduleBinding {
                    category: "nigeria".into(),
                    destination: None,
                }],
            }],
            categories: vec![],
        };
        assert!(schedule.resolve(None).is_empty());
    }

    #[test]
    fn schedule_yaml_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schedule.yaml");
        std::fs::write(
            &path,
            "triggers:\n  - name: morning\n    at: \"08:30\"\n    deliveries:\n      - category: nigeria\n        destination: -100123\n      - category: tech\ncategories: [nigeria, tech]\n",
        )
        .expect("write schedule");

        let schedule = load_schedule(&path).expect("load");
        assert_eq!(schedule.triggers.len(), 1);
        assert_eq!(schedule.triggers[0].at, "08:30");
        assert_eq!(schedule.triggers[0].deliveries[0].destination, Some(-100123));
        assert_eq!(schedule.triggers[0].deliveries[1].destination, None);
        assert_eq!(schedule.categories, vec!["nigeria", "tech"]);
    }

    #[test]
    fn default_daily_matches_original_run() {
        let schedule = ScheduleFile::default_daily();
        assert_eq!(schedule.triggers.len(), 1);
        assert_eq!(schedule.triggers[0].at, "08:30");
        assert_eq!(schedule.triggers[0].deliveries.len(), 3);
        let triggers = schedule.resolve(Some(-7));
        assert_eq!(triggers[0].deliveries.len(), 3);
        assert!(triggers[0].deliveries.iter().all(|d| d.destination == -7));
    }

    #[test]
    fn missing_schedule_file_is_an_error_callers_can_soften() {
        let err = load_schedule(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading"));
    }
}
