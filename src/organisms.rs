use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::OrganismSourceConfig;
use crate::domain::Organism;
use crate::error::HarvestError;

const QUERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Source of the organism list, queried once per run.
pub trait OrganismSource: Send + Sync {
    fn organisms(&self) -> Result<Vec<Organism>, HarvestError>;
}

/// Reads `taxid<TAB>name` rows from a file.
#[derive(Debug, Clone)]
pub struct FileOrganismSource {
    path: Utf8PathBuf,
}

impl FileOrganismSource {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}

impl OrganismSource for FileOrganismSource {
    fn organisms(&self) -> Result<Vec<Organism>, HarvestError> {
        let content = fs::read_to_string(self.path.as_std_path()).map_err(|err| {
            HarvestError::OrganismQuery(format!("read {}: {err}", self.path))
        })?;
        let organisms = parse_rows(&content)?;
        info!(count = organisms.len(), path = %self.path, "loaded organism list");
        Ok(organisms)
    }
}

/// Runs the organism query through `psql` in unaligned, tuples-only mode.
pub struct PsqlOrganismSource<C: CommandRunner> {
    runner: Arc<C>,
    program: String,
    connection: String,
    query: String,
}

impl<C: CommandRunner> PsqlOrganismSource<C> {
    pub fn new(
        runner: Arc<C>,
        program: impl Into<String>,
        connection: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            connection: connection.into(),
            query: query.into(),
        }
    }

    /// Reads the connection string from `env_key`; absence is fatal.
    pub fn from_env<F>(
        runner: Arc<C>,
        program: &str,
        env_key: &str,
        query: &str,
        lookup: F,
    ) -> Result<Self, HarvestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let connection = lookup(env_key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| HarvestError::MissingEnv(env_key.to_string()))?;
        Ok(Self::new(runner, program, connection, query))
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program).args([
            self.connection.as_str(),
            "--no-psqlrc",
            "-A",
            "-t",
            "-F",
            "\t",
            "-c",
            self.query.as_str(),
        ])
    }
}

impl<C: CommandRunner> OrganismSource for PsqlOrganismSource<C> {
    fn organisms(&self) -> Result<Vec<Organism>, HarvestError> {
        info!("querying organism list");
        let output = self.runner.execute(&self.command(), QUERY_TIMEOUT)?;
        if output.timed_out {
            return Err(HarvestError::OrganismQuery("query timed out".to_string()));
        }
        if !output.success() {
            let stderr = output.stderr.trim();
            let message = if stderr.is_empty() {
                format!("{} exited with {:?}", self.program, output.exit_code)
            } else {
                stderr.to_string()
            };
            return Err(HarvestError::OrganismQuery(message));
        }
        let organisms = parse_rows(&output.stdout)?;
        info!(count = organisms.len(), "found organisms in database");
        Ok(organisms)
    }
}

/// Builds the configured source. `lookup` resolves environment variables.
pub fn source_from_config<C, F>(
    config: &OrganismSourceConfig,
    runner: Arc<C>,
    lookup: F,
) -> Result<Box<dyn OrganismSource>, HarvestError>
where
    C: CommandRunner + 'static,
    F: Fn(&str) -> Option<String>,
{
    match config {
        OrganismSourceConfig::File(path) => Ok(Box::new(FileOrganismSource::new(path.clone()))),
        OrganismSourceConfig::Psql {
            program,
            connection_env,
            query,
        } => Ok(Box::new(PsqlOrganismSource::from_env(
            runner,
            program,
            connection_env,
            query,
            lookup,
        )?)),
    }
}

/// Parses `taxid<TAB>name` rows. Blank lines and `#` comments are skipped;
/// an empty taxid column is allowed.
pub fn parse_rows(content: &str) -> Result<Vec<Organism>, HarvestError> {
    let mut organisms = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let (taxid, name) = line.split_once('\t').ok_or_else(|| {
            HarvestError::OrganismQuery(format!("line {}: expected taxid<TAB>name", index + 1))
        })?;
        let name = name.trim();
        if name.is_empty() {
            warn!(line = index + 1, "skipping organism row without a name");
            continue;
        }
        let taxid = match taxid.trim() {
            "" => None,
            value => Some(value.parse::<u32>().map_err(|_| {
                HarvestError::OrganismQuery(format!(
                    "line {}: invalid taxid {value:?}",
                    index + 1
                ))
            })?),
        };
        organisms.push(Organism::new(name, taxid));
    }
    Ok(organisms)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::command::CommandOutput;

    #[test]
    fn parses_rows_with_comments_and_blank_taxids() {
        let rows = "# taxid\tname\n9606\tHomo sapiens\n\n\tUnplaced thing\n10090\tMus musculus\r\n";
        let organisms = parse_rows(rows).unwrap();
        assert_eq!(
            organisms,
            vec![
                Organism::new("Homo sapiens", Some(9606)),
                Organism::new("Unplaced thing", None),
                Organism::new("Mus musculus", Some(10090)),
            ]
        );
    }

    #[test]
    fn rejects_rows_without_separator() {
        let err = parse_rows("9606 Homo sapiens\n").unwrap_err();
        assert_matches!(err, HarvestError::OrganismQuery(_));
    }

    #[derive(Default)]
    struct FakePsql {
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl CommandRunner for FakePsql {
        fn execute(
            &self,
            spec: &CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, HarvestError> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: "9606\tHomo sapiens\n10090\tMus musculus\n".to_string(),
                ..CommandOutput::default()
            })
        }
    }

    #[test]
    fn psql_source_requires_connection_env() {
        let runner = Arc::new(FakePsql::default());
        let err = PsqlOrganismSource::from_env(runner, "psql", "PGDATABASE", "SELECT 1", |_| None)
            .err()
            .unwrap();
        assert_matches!(err, HarvestError::MissingEnv(ref key) if key == "PGDATABASE");
        assert!(err.is_configuration());
    }

    #[test]
    fn psql_source_passes_connection_and_query() {
        let runner = Arc::new(FakePsql::default());
        let source = PsqlOrganismSource::from_env(
            runner.clone(),
            "psql",
            "PGDATABASE",
            "SELECT 1",
            |_| Some("postgres://reader@db/rnacen".to_string()),
        )
        .unwrap();
        let organisms = source.organisms().unwrap();
        assert_eq!(organisms.len(), 2);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[0], "postgres://reader@db/rnacen");
        assert_eq!(calls[0].args.last().map(String::as_str), Some("SELECT 1"));
    }
}
