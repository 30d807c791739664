//! # etl-cli — job runner for the graph-loading ETL engine
//!
//! Reads a job spec YAML file describing one source/validator/sink (and
//! optionally a splitter + parallel wave processor for relationship-heavy
//! loads), wires the corresponding `BatchProcessor` chain, and drives it to
//! completion as a single [`etl_core::Task`].
//!
//! ```bash
//! etl-cli --job jobs/load-agencies.yml
//! RUST_LOG=debug etl-cli --job jobs/load-agencies.yml --batch-size 2000
//! ```
//!
//! Target database and reporter selection come from the environment (see
//! `NEO4J_URI`/`NEO4J_USERNAME`/`NEO4J_PASSWORD`/`NEO4J_DATABASE`,
//! `NEO4J_TEST_DATABASE`, `REPORTER_DATABASE`, `ETL_ERROR_PATH`,
//! `ETL_TEST_MODE`), loaded through the `config` crate so job specs and env
//! vars share one lookup path.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use etl_core::row::Row;
use etl_core::{
    BatchProcessor, BatchResult, ETLContext, EtlError, GraphSessionFactory, ProgressReporter, Statistics, StdoutProgressReporter, Task,
    TaskReturn, TaskTreeSpec,
};
use etl_io::{CsvDialect, CsvSource, CypherSink, CypherSpec, Neo4jConfig, Neo4jGraphClient, Neo4jProgressReporter, SqlSource};
use etl_tx::{
    CanonicalIntegerExtractor, ClosedLoopTerminator, DictLastDigitExtractor, ParallelWaveProcessor, RowSchema, SingleBatchSource,
    SplittingProcessor, TupleLastDigitExtractor, ValidationIssue, ValidationProcessor, WorkerFactory,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "etl-cli")]
#[command(about = "Runs one graph-loading ETL job described by a job spec YAML file")]
struct Args {
    /// Path to the job spec YAML file.
    #[arg(short, long)]
    job: PathBuf,

    /// Rows requested from each upstream `get_batch` call.
    #[arg(long, default_value_t = 5000)]
    batch_size: usize,
}

#[derive(Debug, Deserialize)]
struct JobSpec {
    name: String,
    source: SourceSpec,
    #[serde(default)]
    validator: Option<ValidatorSpec>,
    #[serde(default)]
    splitter: Option<SplitterSpec>,
    sink: SinkSpec,
    #[serde(default)]
    parallel: Option<ParallelSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SourceSpec {
    Csv {
        path: PathBuf,
        #[serde(default)]
        delimiter: Option<char>,
        #[serde(default)]
        quote: Option<char>,
        #[serde(default)]
        escape: Option<char>,
    },
    Sql { dsn: String, query: String },
}

#[derive(Debug, Deserialize)]
struct ValidatorSpec {
    /// Fields every row must carry a non-null value for; a minimal
    /// declarative stand-in for a compiled `TypedSchema<T>` when the schema
    /// itself comes from a YAML file rather than Rust source.
    required_fields: Vec<String>,
    error_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SplitterSpec {
    extractor: ExtractorSpec,
    table_size: usize,
    #[serde(default = "default_near_full_ratio")]
    near_full_ratio: f64,
    #[serde(default = "default_burst_multiplier")]
    burst_multiplier: u32,
}

fn default_near_full_ratio() -> f64 {
    0.85
}

fn default_burst_multiplier() -> u32 {
    25
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ExtractorSpec {
    TupleLastDigit,
    DictLastDigit { start_key: String, end_key: String },
    CanonicalInteger { start_key: String, end_key: String },
}

#[derive(Debug, Deserialize)]
struct SinkSpec {
    cypher: CypherSpecYaml,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CypherSpecYaml {
    Single(String),
    Many(Vec<String>),
}

impl From<CypherSpecYaml> for CypherSpec {
    fn from(spec: CypherSpecYaml) -> Self {
        match spec {
            CypherSpecYaml::Single(q) => CypherSpec::Single(q),
            CypherSpecYaml::Many(qs) => CypherSpec::Many(qs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ParallelSpec {
    max_workers: usize,
    #[serde(default = "default_prefetch")]
    prefetch: usize,
}

fn default_prefetch() -> usize {
    2
}

/// Rejects any row missing (or null at) one of `required`, per
/// [`ValidatorSpec::required_fields`].
struct RequiredFieldsSchema {
    required: Vec<String>,
}

impl RowSchema for RequiredFieldsSchema {
    fn validate(&self, row: &Row) -> Result<Row, Vec<ValidationIssue>> {
        let errors: Vec<ValidationIssue> = self
            .required
            .iter()
            .filter(|field| !row.get(field.as_str()).is_some_and(|v| !v.is_null()))
            .map(|field| ValidationIssue { field: field.clone(), message: "required field missing or null".into() })
            .collect();
        if errors.is_empty() {
            Ok(row.clone())
        } else {
            Err(errors)
        }
    }
}

/// Drives one job spec's processor chain to completion, matching the
/// original's pattern of a `Task` that builds its chain and pulls exactly
/// one batch from its terminator.
struct LoadJobTask {
    spec: JobSpec,
    batch_size: usize,
}

#[async_trait]
impl Task for LoadJobTask {
    fn task_name(&self) -> &str {
        &self.spec.name
    }

    async fn run_internal(&mut self, context: &ETLContext) -> TaskReturn {
        match self.run(context).await {
            Ok(statistics) => TaskReturn::ok(statistics),
            Err(e) => TaskReturn::failed(e.to_string()),
        }
    }
}

impl LoadJobTask {
    async fn build_source(&self) -> Result<Box<dyn BatchProcessor>> {
        match &self.spec.source {
            SourceSpec::Csv { path, delimiter, quote, escape } => {
                let mut dialect = CsvDialect::default();
                if let Some(c) = delimiter {
                    dialect.delimiter = Self::ascii_byte(*c, "delimiter")?;
                }
                if let Some(c) = quote {
                    dialect.quote = Self::ascii_byte(*c, "quote")?;
                }
                if let Some(c) = escape {
                    dialect.escape = Some(Self::ascii_byte(*c, "escape")?);
                }
                Ok(Box::new(CsvSource::open_with(path, dialect)?))
            }
            SourceSpec::Sql { dsn, query } => {
                let pool = sqlx::postgres::PgPoolOptions::new().connect(dsn).await.with_context(|| format!("connecting to {dsn}"))?;
                Ok(Box::new(SqlSource::open(pool, query.clone(), None).await))
            }
        }
    }

    fn ascii_byte(c: char, field: &'static str) -> Result<u8> {
        if c.is_ascii() {
            Ok(c as u8)
        } else {
            Err(anyhow::anyhow!("CSV {field} must be a single ASCII character, got {c:?}"))
        }
    }

    fn error_path(&self, configured: &Path) -> PathBuf {
        match ETLContext::env("ETL_ERROR_PATH") {
            Some(dir) if !dir.is_empty() => {
                let file_name = configured.file_name().unwrap_or_else(|| std::ffi::OsStr::new("errors.ndjson"));
                PathBuf::from(dir).join(file_name)
            }
            _ => configured.to_path_buf(),
        }
    }

    fn build_validator(&self, predecessor: Box<dyn BatchProcessor>) -> Box<dyn BatchProcessor> {
        let Some(validator) = &self.spec.validator else {
            return predecessor;
        };
        let schema = RequiredFieldsSchema { required: validator.required_fields.clone() };
        Box::new(ValidationProcessor::new(predecessor, schema, self.error_path(&validator.error_path)))
    }

    fn worker_factory(&self, session_factory: Arc<dyn GraphSessionFactory>) -> WorkerFactory {
        let spec: CypherSpec = self.spec.sink.cypher_spec();
        Arc::new(move |source: SingleBatchSource| {
            Box::new(CypherSink::new(source, session_factory.clone(), spec.clone())) as Box<dyn BatchProcessor>
        })
    }

    fn build_splitter(&self, predecessor: Box<dyn BatchProcessor>) -> Result<Box<dyn BatchProcessor>> {
        let Some(splitter) = &self.spec.splitter else {
            return Ok(predecessor);
        };
        let table_size = splitter.table_size;
        let near_full_ratio = splitter.near_full_ratio;
        let burst_multiplier = splitter.burst_multiplier;
        let processor: Box<dyn BatchProcessor> = match &splitter.extractor {
            ExtractorSpec::TupleLastDigit => {
                Box::new(SplittingProcessor::new(predecessor, TupleLastDigitExtractor::new(table_size), table_size, near_full_ratio, burst_multiplier)?)
            }
            ExtractorSpec::DictLastDigit { start_key, end_key } => Box::new(SplittingProcessor::new(
                predecessor,
                DictLastDigitExtractor::new(table_size, start_key.clone(), end_key.clone()),
                table_size,
                near_full_ratio,
                burst_multiplier,
            )?),
            ExtractorSpec::CanonicalInteger { start_key, end_key } => Box::new(SplittingProcessor::new(
                predecessor,
                CanonicalIntegerExtractor::new(table_size, start_key.clone(), end_key.clone()),
                table_size,
                near_full_ratio,
                burst_multiplier,
            )?),
        };
        Ok(processor)
    }

    fn build_sink(&self, predecessor: Box<dyn BatchProcessor>, session_factory: Arc<dyn GraphSessionFactory>) -> Box<dyn BatchProcessor> {
        match &self.spec.parallel {
            Some(parallel) => {
                let factory = self.worker_factory(session_factory);
                Box::new(ParallelWaveProcessor::new(predecessor, factory, parallel.max_workers, parallel.prefetch))
            }
            None => Box::new(CypherSink::new(predecessor, session_factory, self.spec.sink.cypher_spec())),
        }
    }

    async fn run(&self, context: &ETLContext) -> Result<Statistics> {
        if self.spec.parallel.is_some() && self.spec.splitter.is_none() {
            bail!("job '{}' configures `parallel` without a `splitter`", self.spec.name);
        }

        let source = self.build_source().await?;
        let validated = self.build_validator(source);
        let routed = self.build_splitter(validated)?;
        let sink = self.build_sink(routed, context.session_factory().clone());
        let mut terminator = ClosedLoopTerminator::new(sink, context.reporter().clone(), self.spec.name.clone());

        let result = terminator
            .get_batch(self.batch_size)
            .await
            .map_err(|e: EtlError| anyhow::anyhow!(e))?
            .unwrap_or_else(BatchResult::empty);
        Ok(result.statistics)
    }
}

impl SinkSpec {
    fn cypher_spec(&self) -> CypherSpec {
        match &self.cypher {
            CypherSpecYaml::Single(q) => CypherSpec::Single(q.clone()),
            CypherSpecYaml::Many(qs) => CypherSpec::Many(qs.clone()),
        }
    }
}

fn neo4j_config() -> Result<Neo4jConfig> {
    let uri = ETLContext::env("NEO4J_URI").context("NEO4J_URI not set")?;
    let username = ETLContext::env("NEO4J_USERNAME").context("NEO4J_USERNAME not set")?;
    let password = ETLContext::env("NEO4J_PASSWORD").context("NEO4J_PASSWORD not set")?;
    let database = if ETLContext::test_mode() {
        ETLContext::env("NEO4J_TEST_DATABASE").unwrap_or_else(|| "neo4j".to_string())
    } else {
        ETLContext::env("NEO4J_DATABASE").unwrap_or_else(|| "neo4j".to_string())
    };
    Ok(Neo4jConfig { uri, username, password, database })
}

fn build_reporter(session_factory: Arc<dyn GraphSessionFactory>) -> Arc<dyn ProgressReporter> {
    match ETLContext::env("REPORTER_DATABASE") {
        Some(_) => Arc::new(Neo4jProgressReporter::new(session_factory)),
        None => Arc::new(StdoutProgressReporter::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::from_default_env()).with(tracing_subscriber::fmt::layer()).init();

    let args = Args::parse();
    let spec: JobSpec = {
        let yaml = std::fs::read_to_string(&args.job).with_context(|| format!("reading {}", args.job.display()))?;
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", args.job.display()))?
    };

    let session_factory: Arc<dyn GraphSessionFactory> = Arc::new(Neo4jGraphClient::connect(neo4j_config()?).await?);
    let reporter = build_reporter(session_factory.clone());
    let context = ETLContext::new(session_factory, reporter);

    let mut task = LoadJobTask { spec, batch_size: args.batch_size };
    context.reporter().register_tasks(&TaskTreeSpec::Leaf(task.task_name().to_string())).await;
    let result = task.execute(&context).await;

    if !result.success {
        bail!(result.error.unwrap_or_else(|| "job failed".to_string()));
    }
    Ok(())
}
