//! Stage lists for serial and parallel runs.

use crate::model::RunConfig;
use std::io;
use std::path::Path;

pub const DECOMPOSE: &str = "decompose";
pub const SOLVE: &str = "solve";
pub const RECONSTRUCT: &str = "reconstruct";

const DECOMPOSE_COMMAND: &str = "decomposePar -force";
const SERIAL_SOLVE_COMMAND: &str = "{solver}";
const PARALLEL_SOLVE_COMMAND: &str = "mpirun -np {workers} {solver} -parallel";
const RECONSTRUCT_COMMAND: &str = "reconstructPar";

/// Dictionary rewritten with the worker count before a parallel decompose.
pub const DECOMPOSE_DICT: &str = "system/decomposeParDict";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub command: String,
    /// A failure of this stage fails the run and skips what follows.
    pub required_for_success: bool,
}

impl StageSpec {
    pub fn required(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required_for_success: true,
        }
    }

    pub fn optional(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required_for_success: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<StageSpec>,
}

impl StagePlan {
    /// Serial: `[solve]`. Parallel: `[decompose, solve, reconstruct]`.
    /// Post stages from the config follow either way.
    pub fn build(cfg: &RunConfig) -> Self {
        let overrides = &cfg.commands;
        let mut stages = Vec::with_capacity(3 + cfg.post.len());

        if cfg.parallel {
            let decompose = overrides.decompose.as_deref().unwrap_or(DECOMPOSE_COMMAND);
            let solve = overrides.solve.as_deref().unwrap_or(PARALLEL_SOLVE_COMMAND);
            let reconstruct = overrides
                .reconstruct
                .as_deref()
                .unwrap_or(RECONSTRUCT_COMMAND);
            stages.push(StageSpec::required(DECOMPOSE, expand(decompose, cfg)));
            stages.push(StageSpec::required(SOLVE, expand(solve, cfg)));
            stages.push(StageSpec::required(RECONSTRUCT, expand(reconstruct, cfg)));
        } else {
            let solve = overrides.solve.as_deref().unwrap_or(SERIAL_SOLVE_COMMAND);
            stages.push(StageSpec::required(SOLVE, expand(solve, cfg)));
        }

        for post in &cfg.post {
            let command = expand(&post.command, cfg);
            stages.push(if post.required {
                StageSpec::required(post.name.clone(), command)
            } else {
                StageSpec::optional(post.name.clone(), command)
            });
        }

        Self { stages }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

fn expand(template: &str, cfg: &RunConfig) -> String {
    template
        .replace("{workers}", &cfg.workers.to_string())
        .replace("{solver}", &cfg.solver)
}

/// Rewrite the `numberOfSubdomains` entry of `system/decomposeParDict` to
/// `workers`. Returns `false` when the case has no such dictionary.
pub async fn set_subdomains(work_dir: &Path, workers: usize) -> io::Result<bool> {
    let path = work_dir.join(DECOMPOSE_DICT);
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let Some(rewritten) = rewrite_subdomains(&contents, workers) else {
        return Ok(false);
    };
    tokio::fs::write(&path, rewritten).await?;
    Ok(true)
}

fn rewrite_subdomains(contents: &str, workers: usize) -> Option<String> {
    let mut found = false;
    let mut out = String::with_capacity(contents.len() + 8);
    for line in contents.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let is_entry = trimmed
            .strip_prefix("numberOfSubdomains")
            .is_some_and(|rest| rest.starts_with(char::is_whitespace));
        if is_entry {
            found = true;
            let indent = &line[..line.len() - trimmed.len()];
            let newline = if line.ends_with('\n') { "\n" } else { "" };
            out.push_str(&format!("{indent}numberOfSubdomains {workers};{newline}"));
        } else {
            out.push_str(line);
        }
    }
    found.then_some(out)
}
