use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use paysentinel::config::Config;
use paysentinel::detect::Severity;
use paysentinel::rules::{MetricType, NewRule, Operator, RuleRegistry};

const EXIT_CONFIG: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "paysentinel",
    about = "Real-time payment telemetry and anomaly alerting",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the full daemon (ingest API + detector + enricher)
    Serve {
        /// Bind address (overrides BIND_ADDR)
        #[arg(long)]
        bind: Option<String>,

        /// SQLite database path (overrides DATABASE_PATH)
        #[arg(long)]
        db: Option<String>,
    },

    /// Run the detector and enricher without the ingest API
    Detect {
        /// SQLite database path (overrides DATABASE_PATH)
        #[arg(long)]
        db: Option<String>,
    },

    /// Manage alert rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// List all rules
    List {
        #[arg(long)]
        db: Option<String>,
    },

    /// Create a new rule
    Create {
        #[arg(long)]
        db: Option<String>,

        /// Merchant scope (omit for a global rule)
        #[arg(long)]
        merchant: Option<String>,

        /// Country filter (two uppercase letters)
        #[arg(long)]
        country: Option<String>,

        /// Provider filter (e.g. STRIPE)
        #[arg(long)]
        provider: Option<String>,

        /// Issuer filter (e.g. BBVA)
        #[arg(long)]
        issuer: Option<String>,

        /// Metric: APPROVAL_RATE, ERROR_RATE, DECLINE_RATE, TOTAL_VOLUME
        #[arg(long, default_value = "ERROR_RATE")]
        metric: String,

        /// Comparison operator: <, >, <=, >=
        #[arg(long, default_value = ">")]
        operator: String,

        /// Threshold (fraction for rates, count for volume)
        #[arg(long, default_value_t = 0.10)]
        threshold: f64,

        /// Minimum sample size before the rule is evaluated
        #[arg(long, default_value_t = 30)]
        min_transactions: u64,

        /// UTC hour the rule starts applying (with --end-hour)
        #[arg(long)]
        start_hour: Option<u8>,

        /// UTC hour the rule stops applying (exclusive)
        #[arg(long)]
        end_hour: Option<u8>,

        /// Severity: WARNING or CRITICAL
        #[arg(long, default_value = "WARNING")]
        severity: String,

        /// Adverse-outcome floor before an incident opens
        #[arg(long)]
        min_errors: Option<u64>,
    },

    /// Soft-delete a rule
    Delete {
        #[arg(long)]
        db: Option<String>,

        /// Rule id to deactivate
        rule_id: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

fn load_config(db_override: Option<String>) -> Result<Config, i32> {
    match Config::from_env() {
        Ok(mut cfg) => {
            if let Some(db) = db_override {
                cfg.database_path = db;
            }
            Ok(cfg)
        }
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            Err(EXIT_CONFIG)
        }
    }
}

/// Cancel the token on Ctrl-C and report whether we were interrupted.
fn spawn_signal_handler(shutdown: CancellationToken) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
    let interrupted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            shutdown.cancel();
        }
    });
    interrupted
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Serve { bind, db } => {
            let mut cfg = match load_config(db) {
                Ok(cfg) => cfg,
                Err(code) => return code,
            };
            if let Some(bind) = bind {
                cfg.bind_addr = bind;
            }

            let shutdown = CancellationToken::new();
            let interrupted = spawn_signal_handler(shutdown.clone());

            match paysentinel::serve(cfg, shutdown).await {
                Ok(()) => {
                    if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
                        EXIT_INTERRUPTED
                    } else {
                        0
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "daemon failed to start");
                    EXIT_DEPENDENCY
                }
            }
        }

        Commands::Detect { db } => {
            let cfg = match load_config(db) {
                Ok(cfg) => cfg,
                Err(code) => return code,
            };

            let shutdown = CancellationToken::new();
            let interrupted = spawn_signal_handler(shutdown.clone());

            match paysentinel::run_detector(cfg, shutdown).await {
                Ok(()) => {
                    if interrupted.load(std::sync::atomic::Ordering::SeqCst) {
                        EXIT_INTERRUPTED
                    } else {
                        0
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "detector failed to start");
                    EXIT_DEPENDENCY
                }
            }
        }

        Commands::Rules { action } => run_rules(action),
    }
}

fn open_registry(db_override: Option<String>) -> Result<RuleRegistry, i32> {
    let cfg = load_config(db_override)?;
    match paysentinel::storage::open_pool(&cfg.database_path) {
        Ok(pool) => Ok(RuleRegistry::new(pool)),
        Err(e) => {
            tracing::error!(error = %e, "database unavailable");
            Err(EXIT_DEPENDENCY)
        }
    }
}

fn run_rules(action: RulesAction) -> i32 {
    match action {
        RulesAction::List { db } => {
            let registry = match open_registry(db) {
                Ok(r) => r,
                Err(code) => return code,
            };
            match registry.list() {
                Ok(rules) if rules.is_empty() => {
                    println!("No rules found.");
                    0
                }
                Ok(rules) => {
                    println!(
                        "{:<36} | {:<16} | {:<8} | {:<13} | {:<9} | Active",
                        "Rule ID", "Merchant", "Country", "Metric", "Threshold"
                    );
                    println!(
                        "{:-<36}-|-{:-<16}-|-{:-<8}-|-{:-<13}-|-{:-<9}-|-{:-<6}",
                        "", "", "", "", "", ""
                    );
                    for rule in rules {
                        println!(
                            "{:<36} | {:<16} | {:<8} | {:<13} | {} {:<7} | {}",
                            rule.rule_id,
                            rule.merchant_id.as_deref().unwrap_or("GLOBAL"),
                            rule.country.as_deref().unwrap_or("ALL"),
                            rule.metric_type.as_str(),
                            rule.operator.as_str(),
                            rule.threshold,
                            if rule.active { "yes" } else { "no" },
                        );
                    }
                    0
                }
                Err(e) => {
                    eprintln!("Failed to list rules: {e}");
                    EXIT_DEPENDENCY
                }
            }
        }

        RulesAction::Create {
            db,
            merchant,
            country,
            provider,
            issuer,
            metric,
            operator,
            threshold,
            min_transactions,
            start_hour,
            end_hour,
            severity,
            min_errors,
        } => {
            let Some(metric_type) = MetricType::parse(&metric) else {
                eprintln!("Unknown metric: {metric}");
                return EXIT_CONFIG;
            };
            let Some(operator) = Operator::parse(&operator) else {
                eprintln!("Unknown operator: {operator}");
                return EXIT_CONFIG;
            };
            let Some(severity) = Severity::parse(&severity) else {
                eprintln!("Unknown severity: {severity}");
                return EXIT_CONFIG;
            };

            let registry = match open_registry(db) {
                Ok(r) => r,
                Err(code) => return code,
            };
            let new = NewRule {
                merchant_id: merchant,
                country,
                provider,
                issuer,
                metric_type,
                operator,
                threshold,
                min_transactions,
                start_hour,
                end_hour,
                severity,
                min_consecutive_errors: min_errors,
            };
            match registry.create(&new) {
                Ok(rule) => {
                    println!("Rule created: {}", rule.rule_id);
                    println!("  Scope:     {}", rule.merchant_id.as_deref().unwrap_or("GLOBAL"));
                    println!(
                        "  Condition: {} {} {}",
                        rule.metric_type.as_str(),
                        rule.operator.as_str(),
                        rule.threshold
                    );
                    println!("  Takes effect after the next rule refresh (~10s).");
                    0
                }
                Err(e) => {
                    eprintln!("Failed to create rule: {e}");
                    EXIT_CONFIG
                }
            }
        }

        RulesAction::Delete { db, rule_id } => {
            let Ok(rule_id) = Uuid::parse_str(&rule_id) else {
                eprintln!("Invalid rule id: {rule_id}");
                return EXIT_CONFIG;
            };
            let registry = match open_registry(db) {
                Ok(r) => r,
                Err(code) => return code,
            };
            match registry.soft_delete(rule_id) {
                Ok(true) => {
                    println!("Rule {rule_id} deactivated.");
                    0
                }
                Ok(false) => {
                    eprintln!("Rule {rule_id} not found.");
                    EXIT_CONFIG
                }
                Err(e) => {
                    eprintln!("Failed to delete rule: {e}");
                    EXIT_DEPENDENCY
                }
            }
        }
    }
}
