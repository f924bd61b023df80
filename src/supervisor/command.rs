use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::WorkerConfig;
use crate::job::Job;

/// Placeholder key shipped in sample model configs; never forwarded
const PLACEHOLDER_API_KEY: &str = "sk-xxxxx";

/// Fully resolved worker invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    /// Command line as one string, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Argument vector of a job's worker
    ///
    /// Order is fixed: identifiers, tuning flags, one `--services` per
    /// endpoint, credentials when configured, then optional prompts.
    pub fn for_job(job: &Job, services: &[String], config: &WorkerConfig) -> Self {
        let params = job.params();
        let target = &params.model;

        let mut builder = WorkerCommandBuilder::new(&config.program)
            .env("PYTHONUNBUFFERED", "1")
            .envs(&config.env);
        if let Some(entrypoint) = &config.entrypoint {
            builder = builder.arg(entrypoint);
        }
        if let Some(dir) = &config.working_dir {
            builder = builder.current_dir(dir);
        }

        builder = builder
            .flag("--file-id", &params.file_id)
            .flag("--user-id", &params.owner_id)
            .flag("--task-id", job.id())
            .flag("--model", target.path.as_deref().unwrap_or(&target.model))
            .flag("--batch-size", params.batch_size)
            .flag("--max-concurrent", params.max_concurrent)
            .flag("--min-score", params.min_score)
            .flag("--task-type", &params.task_type)
            .flag("--variants-per-sample", params.variants_per_sample)
            .flag("--data-rounds", params.data_rounds)
            .flag("--retry-times", params.retry_times);

        for service in services {
            builder = builder.flag("--services", service);
        }

        match &target.credentials {
            Some(credentials) => {
                let key = credentials.api_key.trim();
                if !key.is_empty() && key != PLACEHOLDER_API_KEY {
                    builder = builder.flag("--api-key", key);
                }
                if target.is_vllm {
                    builder = builder.arg("--is-vllm");
                }
                builder = builder
                    .flag("--top-p", format!("{:.1}", credentials.top_p))
                    .flag("--max-tokens", credentials.max_tokens)
                    .flag("--timeout", credentials.timeout_secs);
            }
            None if target.is_vllm => builder = builder.arg("--is-vllm"),
            None => {}
        }

        if let Some(prompt) = params.special_prompt.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.flag("--special-prompt", prompt);
        }
        if let Some(directions) = params.directions.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.flag("--directions", directions);
        }

        builder.build()
    }
}

pub struct WorkerCommandBuilder {
    command: WorkerCommand,
}

impl WorkerCommandBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            command: WorkerCommand {
                program: program.to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                working_dir: None,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.command.args.push(arg.to_string());
        self
    }

    /// `name value` pair
    pub fn flag(mut self, name: &str, value: impl ToString) -> Self {
        self.command.args.push(name.to_string());
        self.command.args.push(value.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.command.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.command
                .env
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.command.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn build(self) -> WorkerCommand {
        self.command
    }
}
