//! Containerized integration-test invocation.
//!
//! A [`TestInvocation`] describes one Compose service that builds the test
//! image and runs a single test module with `--no-fail-fast`. It can be
//! rendered to a Compose "3" file, read back from one, and run through
//! `docker compose`.
//!
//! The API key the tests need is only ever referenced by name. It reaches
//! the container through the caller's environment at run time and never
//! appears in the image build or in the rendered file.

use crate::errors::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeMap,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process,
};

/// Secret required by the tests, passed through by name.
pub const SECRET_ENV: &str = "TEST_DATADOG_API_KEY";

/// Build argument pinning the toolchain of the test image.
pub const RUST_VERSION_ARG: &str = "RUST_VERSION";

/// Named cache volumes and where they are mounted. They outlive a run and
/// are shared by every run on the host.
pub const CACHE_VOLUMES: [(&str, &str); 2] = [
    ("cargogit", "/usr/local/cargo/git"),
    ("cargoregistry", "/usr/local/cargo/registry"),
];

const COMPOSE_VERSION: &str = "3";
const NO_FAIL_FAST: &str = "--no-fail-fast";

/// Volume attached to the test service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mount {
    /// Host path mounted read/write.
    Bind {
        /// Host path.
        source: String,
        /// Path inside the container.
        target: String,
    },
    /// Named volume managed by the container engine.
    Named {
        /// Volume name, declared at the top level of the file.
        name: String,
        /// Path inside the container.
        target: String,
    },
}

impl Mount {
    /// Parse compose short syntax, `source:target[:mode]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(3, ':');
        let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
            return Err(Error::InvalidCompose(format!(
                "volume `{spec}` must have the form source:target"
            )));
        };
        match parts.next() {
            None | Some("rw") => {}
            Some(mode) => {
                return Err(Error::InvalidCompose(format!(
                    "volume `{spec}` must be read/write, got mode `{mode}`"
                )))
            }
        }
        let (source, target) = (source.to_owned(), target.to_owned());
        if is_volume_name(&source) {
            Ok(Mount::Named {
                name: source,
                target,
            })
        } else {
            Ok(Mount::Bind { source, target })
        }
    }

    /// Container path.
    pub fn target(&self) -> &str {
        match self {
            Mount::Bind { target, .. } | Mount::Named { target, .. } => target,
        }
    }
}

impl std::fmt::Display for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mount::Bind { source, target } => write!(f, "{source}:{target}"),
            Mount::Named { name, target } => write!(f, "{name}:{target}"),
        }
    }
}

fn is_volume_name(source: &str) -> bool {
    let mut chars = source.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// One containerized run of a scoped test module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestInvocation {
    /// Compose service name.
    pub service: String,
    /// Image build context.
    pub context: String,
    /// Dockerfile, relative to the context.
    pub dockerfile: String,
    /// Image build arguments, `(name, value)`.
    pub build_args: Vec<(String, String)>,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Test command and its arguments.
    pub command: Vec<String>,
    /// Environment variables passed through by name.
    pub environment: Vec<String>,
    /// Volumes.
    pub volumes: Vec<Mount>,
}

impl Default for TestInvocation {
    /// The Datadog metrics integration suite.
    fn default() -> Self {
        Self::for_module(
            "datadog-metrics-integration-tests",
            "::datadog::metrics::",
        )
    }
}

impl TestInvocation {
    /// Run the library tests matching `filter` with only `feature` enabled.
    pub fn for_module(feature: &str, filter: &str) -> Self {
        let command = [
            "cargo",
            "nextest",
            "run",
            NO_FAIL_FAST,
            "--no-default-features",
            "--features",
            feature,
            "--lib",
            filter,
        ];
        let mut volumes = vec![Mount::Bind {
            source: "${PWD}".into(),
            target: "/code".into(),
        }];
        volumes.extend(CACHE_VOLUMES.iter().map(|(name, target)| Mount::Named {
            name: (*name).into(),
            target: (*target).into(),
        }));

        Self {
            service: "runner".into(),
            context: "${PWD}".into(),
            dockerfile: "scripts/integration/Dockerfile".into(),
            build_args: vec![(RUST_VERSION_ARG.into(), format!("${{{RUST_VERSION_ARG}}}"))],
            working_dir: "/code".into(),
            command: command.iter().map(|s| (*s).to_owned()).collect(),
            environment: vec![SECRET_ENV.into()],
            volumes,
        }
    }

    /// Check the invocation keeps the secret out of the build, passes it by
    /// name, pins the toolchain, mounts the caches, and does not stop at the
    /// first failing test.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidCompose(msg));

        for (name, value) in &self.build_args {
            if name.contains(SECRET_ENV) || value.contains(SECRET_ENV) {
                return Err(Error::SecretInBuild(SECRET_ENV.into()));
            }
        }
        if self.context.contains(SECRET_ENV) || self.dockerfile.contains(SECRET_ENV) {
            return Err(Error::SecretInBuild(SECRET_ENV.into()));
        }
        if self.command.iter().any(|arg| arg.contains(SECRET_ENV)) {
            return Err(Error::SecretInBuild(SECRET_ENV.into()));
        }

        if self.service.is_empty() || self.context.is_empty() || self.dockerfile.is_empty() {
            return invalid("service, build context and dockerfile are required".into());
        }
        if !self.build_args.iter().any(|(name, _)| name == RUST_VERSION_ARG) {
            return invalid(format!("build argument `{RUST_VERSION_ARG}` is required"));
        }
        if !self.environment.iter().any(|name| name == SECRET_ENV) {
            return invalid(format!("environment must pass `{SECRET_ENV}` through"));
        }
        if self.command.is_empty() {
            return invalid("test command is empty".into());
        }
        if !self.command.iter().any(|arg| arg == NO_FAIL_FAST) {
            return invalid(format!("test command must run with `{NO_FAIL_FAST}`"));
        }
        for (name, target) in CACHE_VOLUMES {
            let mounted = self.volumes.iter().any(|m| {
                matches!(m, Mount::Named { name: n, target: t } if n == name && t == target)
            });
            if !mounted {
                return invalid(format!("named volume `{name}` must be mounted at `{target}`"));
            }
        }
        let workdir_bound = self.volumes.iter().any(|m| {
            matches!(m, Mount::Bind { target, .. } if *target == self.working_dir)
        });
        if !workdir_bound {
            return invalid(format!(
                "the working tree must be bind mounted at `{}`",
                self.working_dir
            ));
        }
        Ok(())
    }

    /// Compose model with this invocation as its only service.
    pub fn to_compose(&self) -> Result<ComposeFile> {
        self.validate()?;

        let service = Service {
            build: Build {
                context: self.context.clone(),
                dockerfile: self.dockerfile.clone(),
                args: KeyValues::List(
                    self.build_args
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect(),
                ),
            },
            working_dir: Some(self.working_dir.clone()),
            command: self.command.clone(),
            environment: KeyValues::List(self.environment.clone()),
            volumes: self.volumes.iter().map(ToString::to_string).collect(),
        };
        let volumes = self
            .volumes
            .iter()
            .filter_map(|m| match m {
                Mount::Named { name, .. } => Some((name.clone(), Some(VolumeSpec::default()))),
                Mount::Bind { .. } => None,
            })
            .collect();

        Ok(ComposeFile {
            version: COMPOSE_VERSION.into(),
            services: BTreeMap::from([(self.service.clone(), service)]),
            volumes,
        })
    }

    /// Rendered Compose YAML. Equal invocations render identically.
    pub fn render(&self) -> Result<String> {
        self.to_compose()?.to_yaml()
    }

    /// Extract and validate the invocation from a compose file with exactly
    /// one service.
    pub fn from_compose(file: &ComposeFile) -> Result<Self> {
        if file.version != COMPOSE_VERSION && !file.version.starts_with("3.") {
            return Err(Error::InvalidCompose(format!(
                "compose version must be \"3\", got {:?}",
                file.version
            )));
        }
        let mut services = file.services.iter();
        let (Some((name, service)), None) = (services.next(), services.next()) else {
            return Err(Error::InvalidCompose(format!(
                "expected exactly one service, found {}",
                file.services.len()
            )));
        };

        let mut build_args = Vec::new();
        for (key, value) in service.build.args.entries() {
            let value = value.ok_or_else(|| {
                Error::InvalidCompose(format!("build argument `{key}` has no value"))
            })?;
            build_args.push((key, value));
        }

        let mut environment = Vec::new();
        for (key, value) in service.environment.entries() {
            if key == SECRET_ENV && value.is_some() {
                return Err(Error::SecretInBuild(SECRET_ENV.into()));
            }
            environment.push(key);
        }

        let volumes = service
            .volumes
            .iter()
            .map(|v| Mount::parse(v))
            .collect::<Result<Vec<_>>>()?;
        for mount in &volumes {
            if let Mount::Named { name, .. } = mount {
                if !file.volumes.contains_key(name) {
                    return Err(Error::InvalidCompose(format!(
                        "named volume `{name}` is not declared at the top level"
                    )));
                }
            }
        }

        let invocation = Self {
            service: name.clone(),
            context: service.build.context.clone(),
            dockerfile: service.build.dockerfile.clone(),
            build_args,
            working_dir: service.working_dir.clone().unwrap_or_else(|| "/".into()),
            command: service.command.clone(),
            environment,
            volumes,
        };
        invocation.validate()?;
        Ok(invocation)
    }
}

/// A Compose file, limited to the keys this crate reads and writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Format version.
    #[serde(deserialize_with = "version_string")]
    pub version: String,
    /// Services by name.
    pub services: BTreeMap<String, Service>,
    /// Top-level named volumes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<VolumeSpec>>,
}

impl ComposeFile {
    /// Parse YAML text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// One compose service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Image build.
    pub build: Build,
    /// Working directory in the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Command in exec form.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment, list or map form.
    #[serde(default)]
    pub environment: KeyValues,
    /// Volumes in short syntax.
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Image build section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Build context.
    pub context: String,
    /// Dockerfile path.
    pub dockerfile: String,
    /// Build arguments, list or map form.
    #[serde(default)]
    pub args: KeyValues,
}

/// Options of a top-level named volume. None are used.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {}

/// `KEY=value` lists or `KEY: value` maps, as accepted for `environment`
/// and `build.args`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValues {
    /// `- KEY` or `- KEY=value`
    List(Vec<String>),
    /// `KEY: value`; a null value passes the key through.
    Map(BTreeMap<String, Option<String>>),
}

impl Default for KeyValues {
    fn default() -> Self {
        KeyValues::List(Vec::new())
    }
}

impl KeyValues {
    /// Entries as `(key, value)`; `None` means the value comes from the
    /// caller's environment.
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            KeyValues::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_owned(), Some(v.to_owned())),
                    None => (item.clone(), None),
                })
                .collect(),
            KeyValues::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

fn version_string<'de, D: Deserializer<'de>>(deserializer: D) -> core::result::Result<String, D::Error> {
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "compose version must be a string, got {other:?}"
        ))),
    }
}

/// Process launching, separated so runs can be observed in tests.
pub trait CommandExecutor {
    /// Run `program` with `args`, inheriting stdio and environment, and
    /// return its exit code.
    fn execute(&mut self, program: &str, args: &[String]) -> Result<i32>;

    /// Look up a variable in the environment the child will inherit.
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Runs commands with [`std::process::Command`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&mut self, program: &str, args: &[String]) -> Result<i32> {
        let status = process::Command::new(program)
            .args(args.iter().map(OsStr::new))
            .status()
            .map_err(|e| {
                let e = if e.kind() == io::ErrorKind::NotFound {
                    io::Error::new(e.kind(), format!("command `{program}` not found"))
                } else {
                    e
                };
                Error::io(program, e)
            })?;
        Ok(exit_code(status))
    }
}

#[cfg(unix)]
fn exit_code(status: process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Runs a compose file's test service once.
#[derive(Debug)]
pub struct Runner<E> {
    executor: E,
    compose_file: PathBuf,
}

impl<E: CommandExecutor> Runner<E> {
    /// Runner for the compose file at `compose_file`.
    pub fn new(executor: E, compose_file: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            compose_file: compose_file.into(),
        }
    }

    /// Executor in use.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// `docker compose -f <file> run --rm <service>` argument list.
    pub fn command(&self, invocation: &TestInvocation) -> (String, Vec<String>) {
        let args = [
            "compose".to_owned(),
            "-f".to_owned(),
            self.compose_file.display().to_string(),
            "run".to_owned(),
            "--rm".to_owned(),
            invocation.service.clone(),
        ];
        ("docker".to_owned(), args.to_vec())
    }

    /// Run the test service once and return its exit code unchanged.
    ///
    /// The secret must be set in the environment. A failing run is not
    /// retried and the cache volumes are left in place.
    pub fn run(&mut self, invocation: &TestInvocation) -> Result<i32> {
        invocation.validate()?;
        if self.executor.var(SECRET_ENV).map_or(true, |v| v.is_empty()) {
            return Err(Error::MissingEnvironment(SECRET_ENV.into()));
        }

        let (program, args) = self.command(invocation);
        tracing::info!(
            compose_file = %self.compose_file.display(),
            service = %invocation.service,
            "running integration tests"
        );
        let code = self.executor.execute(&program, &args)?;
        if code == 0 {
            tracing::info!(code, "integration tests passed");
        } else {
            tracing::warn!(code, "integration tests failed");
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!("../fixtures/integration/docker-compose.yml");

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(String, Vec<String>)>,
        code: i32,
        secret: Option<String>,
    }

    impl CommandExecutor for Recorder {
        fn execute(&mut self, program: &str, args: &[String]) -> Result<i32> {
            self.calls.push((program.to_owned(), args.to_vec()));
            Ok(self.code)
        }

        fn var(&self, name: &str) -> Option<String> {
            (name == SECRET_ENV).then(|| self.secret.clone()).flatten()
        }
    }

    #[test]
    fn shipped_fixture_matches_default_invocation() {
        let file = ComposeFile::parse(FIXTURE).unwrap();
        let invocation = TestInvocation::from_compose(&file).unwrap();
        assert_eq!(invocation, TestInvocation::default());
    }

    #[test]
    fn render_is_deterministic_and_reparses() {
        let invocation = TestInvocation::default();
        let first = invocation.render().unwrap();
        assert_eq!(first, invocation.render().unwrap());
        assert!(!first.contains(&format!("{SECRET_ENV}=")));

        let reparsed = TestInvocation::from_compose(&ComposeFile::parse(&first).unwrap()).unwrap();
        assert_eq!(reparsed, invocation);
    }

    #[test]
    fn secret_in_build_args_is_refused() {
        let mut invocation = TestInvocation::default();
        invocation
            .build_args
            .push((SECRET_ENV.into(), format!("${{{SECRET_ENV}}}")));
        assert!(matches!(invocation.render(), Err(Error::SecretInBuild(_))));

        let text = FIXTURE.replace(
            "- TEST_DATADOG_API_KEY",
            "- TEST_DATADOG_API_KEY=hunter2",
        );
        assert!(matches!(
            TestInvocation::from_compose(&ComposeFile::parse(&text).unwrap()),
            Err(Error::SecretInBuild(_))
        ));
    }

    #[test]
    fn contract_violations_are_invalid() {
        let mut no_fail_fast = TestInvocation::default();
        no_fail_fast.command.retain(|a| a != NO_FAIL_FAST);

        let mut no_cache = TestInvocation::default();
        no_cache.volumes.retain(|m| !matches!(m, Mount::Named { name, .. } if name == "cargogit"));

        let mut no_secret = TestInvocation::default();
        no_secret.environment.clear();

        let mut no_toolchain = TestInvocation::default();
        no_toolchain.build_args.clear();

        for invocation in [no_fail_fast, no_cache, no_secret, no_toolchain] {
            assert!(matches!(invocation.validate(), Err(Error::InvalidCompose(_))));
        }
    }

    #[test]
    fn undeclared_volume_and_wrong_version_are_invalid() {
        let mut file = ComposeFile::parse(FIXTURE).unwrap();
        file.volumes.remove("cargoregistry");
        assert!(matches!(
            TestInvocation::from_compose(&file),
            Err(Error::InvalidCompose(_))
        ));

        let file = ComposeFile::parse(&FIXTURE.replace("version: \"3\"", "version: \"2.4\"")).unwrap();
        assert!(matches!(
            TestInvocation::from_compose(&file),
            Err(Error::InvalidCompose(_))
        ));
    }

    #[test]
    fn mount_parsing() {
        assert_eq!(
            Mount::parse("cargogit:/usr/local/cargo/git").unwrap(),
            Mount::Named {
                name: "cargogit".into(),
                target: "/usr/local/cargo/git".into()
            }
        );
        assert!(matches!(Mount::parse("${PWD}:/code").unwrap(), Mount::Bind { .. }));
        assert!(matches!(Mount::parse("./src:/code:rw").unwrap(), Mount::Bind { .. }));
        assert!(Mount::parse("${PWD}:/code:ro").is_err());
        assert!(Mount::parse("nocolon").is_err());
    }

    #[test]
    fn map_form_environment_is_accepted() {
        let text = FIXTURE.replace(
            "environment:\n      - TEST_DATADOG_API_KEY",
            "environment:\n      TEST_DATADOG_API_KEY:",
        );
        let file = ComposeFile::parse(&text).unwrap();
        assert!(matches!(file.services["runner"].environment, KeyValues::Map(_)));
        assert_eq!(
            TestInvocation::from_compose(&file).unwrap(),
            TestInvocation::default()
        );
    }

    #[test]
    fn run_requires_secret() {
        let mut runner = Runner::new(Recorder::default(), "docker-compose.yml");
        assert!(matches!(
            runner.run(&TestInvocation::default()),
            Err(Error::MissingEnvironment(name)) if name == SECRET_ENV
        ));
        assert!(runner.executor().calls.is_empty());
    }

    #[test]
    fn run_propagates_exit_code_without_retry() {
        let recorder = Recorder {
            code: 101,
            secret: Some("key".into()),
            ..Default::default()
        };
        let mut runner = Runner::new(recorder, "ci/docker-compose.yml");
        let invocation = TestInvocation::default();

        assert_eq!(runner.run(&invocation).unwrap(), 101);
        assert_eq!(runner.run(&invocation).unwrap(), 101);

        let calls = &runner.executor().calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(calls[0].0, "docker");
        assert_eq!(
            calls[0].1,
            ["compose", "-f", "ci/docker-compose.yml", "run", "--rm", "runner"]
        );
    }
}
