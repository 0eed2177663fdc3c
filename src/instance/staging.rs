//! Job staging steps shared by every instance variant.
//!
//! Steps are rendered as bash scripts and executed through the instance's
//! guarded runner. The only per-variant input is the [`PathLayout`].

use std::borrow::Cow;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;

use super::{InstanceCore, InstanceError, PathLayout};
use crate::job::{CodeItem, DataItem, EnvType, JobSpec};
use crate::remote::{OperationSpec, RemoteError, Vars};

/// File the environment activation snippet is written to inside the job dir.
pub const ACTIVATE_FILE: &str = ".monkey_activate";
/// File the job may write to report its hyperparameters.
pub const HYPERPARAMETERS_FILE: &str = "hyperparameters.json";
const PERSIST_INTERVAL_SECS: u32 = 30;

/// A failed staging step, before it is attributed to an instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{step}: {source}")]
pub struct StepError {
    /// Step name.
    pub step: &'static str,
    /// Underlying remote failure.
    #[source]
    pub source: RemoteError,
}

impl StepError {
    /// Attributes the failure to `instance`.
    #[must_use]
    pub fn on(self, instance: &str) -> InstanceError {
        InstanceError::Remote {
            instance: instance.to_owned(),
            step: self.step,
            source: self.source,
        }
    }
}

/// Process name the persistence loop of `job_uid` runs under.
#[must_use]
pub fn persist_process_name(job_uid: &str) -> String {
    format!("monkey-persist-{job_uid}")
}

/// `pkill -f` pattern matching the persistence loop but not the shell that
/// runs `pkill` itself.
#[must_use]
pub fn persist_process_pattern(job_uid: &str) -> String {
    format!("[m]onkey-persist-{job_uid}")
}

fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

fn quote_path(path: &Utf8Path) -> String {
    quote(path.as_str())
}

/// Wraps a script into a shell operation executed by bash.
#[must_use]
pub fn bash(script: &str) -> OperationSpec {
    OperationSpec::shell(format!("bash -c {}", quote(script)))
}

/// Shell command unpacking `archive` into `dest`, chosen by extension.
#[must_use]
pub fn extract_command(archive: &Utf8Path, dest: &Utf8Path, extension: &str) -> String {
    let archive_q = quote_path(archive);
    let dest_q = quote_path(dest);
    match extension {
        "zip" => format!("mkdir -p {dest_q} && unzip -o -q {archive_q} -d {dest_q}"),
        "tar.gz" | "tgz" => format!("mkdir -p {dest_q} && tar -xzf {archive_q} -C {dest_q}"),
        _ => format!("mkdir -p {dest_q} && tar -xf {archive_q} -C {dest_q}"),
    }
}

/// Extracts the hyperparameter document from runner output lines.
#[must_use]
pub fn parse_hyperparameters(events: &[String]) -> Option<serde_json::Value> {
    let start = events.iter().position(|line| line.starts_with('{'))?;
    let document = events.get(start..)?.join("\n");
    serde_json::from_str::<serde_json::Value>(&document)
        .ok()
        .filter(serde_json::Value::is_object)
}

/// Staging steps for one instance, resolved against its layout.
pub struct Stager<'a> {
    core: &'a InstanceCore,
    layout: &'a dyn PathLayout,
}

impl<'a> Stager<'a> {
    /// Binds the steps to an instance and its layout.
    #[must_use]
    pub const fn new(core: &'a InstanceCore, layout: &'a dyn PathLayout) -> Self {
        Self { core, layout }
    }

    fn vars(spec: &JobSpec) -> Vars {
        let mut vars = Vars::new();
        vars.insert(
            String::from("job_uid"),
            serde_json::Value::String(spec.job_uid.clone()),
        );
        vars
    }

    /// Job folder on the shared filesystem.
    #[must_use]
    pub fn shared_job_dir(&self, job_uid: &str) -> Utf8PathBuf {
        self.layout.monkeyfs_dir().join("jobs").join(job_uid)
    }

    /// Log file the job's output is teed into.
    #[must_use]
    pub fn log_file(&self, job_uid: &str) -> Utf8PathBuf {
        self.shared_job_dir(job_uid).join("logs").join("run.log")
    }

    fn sync_dir(&self, job_uid: &str) -> Utf8PathBuf {
        self.shared_job_dir(job_uid).join("sync")
    }

    /// Installs one dependency through its `install/<name>` role.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the role fails.
    pub async fn install_dependency(&self, name: &str) -> Result<(), StepError> {
        let mut vars = Vars::new();
        vars.insert(
            String::from("dependency"),
            serde_json::Value::String(name.to_owned()),
        );
        self.core
            .run(
                "install_dependency",
                &OperationSpec::role(format!("install/{name}")),
                vars,
            )
            .await
            .map(drop)
    }

    /// Unpacks a dataset from the shared filesystem into the job directory.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when extraction fails.
    pub async fn setup_data_item(&self, spec: &JobSpec, item: &DataItem) -> Result<(), StepError> {
        let archive = self
            .layout
            .monkeyfs_dir()
            .join("data")
            .join(&item.name)
            .join(&item.checksum)
            .join(format!("data.{}", item.extension));
        let dest = self.layout.job_dir(&spec.job_uid).join(&item.path);
        let script = extract_command(&archive, &dest, &item.extension);
        self.core
            .run("setup_data_item", &bash(&script), Self::vars(spec))
            .await
            .map(drop)
    }

    /// Creates the job directory and its shared counterpart.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the directories cannot be created.
    pub async fn unpack_job_dir(&self, spec: &JobSpec) -> Result<(), StepError> {
        let script = format!(
            "mkdir -p {} {}",
            quote_path(&self.layout.job_dir(&spec.job_uid)),
            quote_path(&self.shared_job_dir(&spec.job_uid)),
        );
        self.core
            .run("unpack_job_dir", &bash(&script), Self::vars(spec))
            .await
            .map(drop)
    }

    /// Unpacks a codebase into the job directory, then restores any persisted
    /// folders saved by an earlier attempt of the same job.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when extraction or restoration fails.
    pub async fn unpack_code_and_persist(
        &self,
        spec: &JobSpec,
        item: &CodeItem,
    ) -> Result<(), StepError> {
        let job_dir = self.layout.job_dir(&spec.job_uid);
        let shared = self.shared_job_dir(&spec.job_uid);
        let archive = self
            .layout
            .monkeyfs_dir()
            .join("code")
            .join(&item.run_name)
            .join(&item.checksum)
            .join(format!("code.{}", item.extension));
        let mut lines = vec![
            String::from("set -e"),
            extract_command(&archive, &job_dir, &item.extension),
        ];
        for folder in &spec.persist {
            let saved = quote_path(&shared.join(folder));
            let target = quote_path(&job_dir.join(folder));
            lines.push(format!(
                "if [ -d {saved} ]; then mkdir -p {target} && cp -a {saved}/. {target}/; fi"
            ));
        }
        self.core
            .run(
                "unpack_code_and_persist",
                &bash(&lines.join("\n")),
                Self::vars(spec),
            )
            .await
            .map(drop)
    }

    /// Creates the shared log folder and run log.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the folder cannot be created.
    pub async fn setup_logs_folder(&self, spec: &JobSpec) -> Result<(), StepError> {
        let log_file = self.log_file(&spec.job_uid);
        let log_dir = log_file
            .parent()
            .map_or_else(|| self.shared_job_dir(&spec.job_uid), Utf8Path::to_path_buf);
        let script = format!(
            "mkdir -p {} && touch {}",
            quote_path(&log_dir),
            quote_path(&log_file)
        );
        self.core
            .run("setup_logs_folder", &bash(&script), Self::vars(spec))
            .await
            .map(drop)
    }

    /// Creates one persisted folder locally and on the shared filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the folders cannot be created.
    pub async fn setup_persist_folder(&self, spec: &JobSpec, folder: &str) -> Result<(), StepError> {
        let script = format!(
            "mkdir -p {} {}",
            quote_path(&self.layout.job_dir(&spec.job_uid).join(folder)),
            quote_path(&self.shared_job_dir(&spec.job_uid).join(folder)),
        );
        self.core
            .run("setup_persist_folder", &bash(&script), Self::vars(spec))
            .await
            .map(drop)
    }

    /// Script that copies every persisted folder to the shared filesystem once.
    #[must_use]
    pub fn sync_once_script(&self, spec: &JobSpec) -> String {
        let job_dir = self.layout.job_dir(&spec.job_uid);
        let shared = self.shared_job_dir(&spec.job_uid);
        let mut lines = vec![String::from("#!/usr/bin/env bash")];
        for folder in &spec.persist {
            lines.push(format!(
                "rsync -a {}/ {}/",
                quote_path(&job_dir.join(folder)),
                quote_path(&shared.join(folder)),
            ));
        }
        lines.push(String::from("true"));
        lines.join("\n")
    }

    /// Writes `sync/sync_once.sh` and `sync/persist.sh` into the shared job
    /// folder and launches the persistence loop under its unique process name.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the scripts cannot be written or started.
    pub async fn start_persist(&self, spec: &JobSpec) -> Result<(), StepError> {
        let sync_dir = self.sync_dir(&spec.job_uid);
        let once = sync_dir.join("sync_once.sh");
        let persist = sync_dir.join("persist.sh");
        let loop_script = format!(
            "#!/usr/bin/env bash\nwhile true; do\n  bash {} >/dev/null 2>&1\n  sleep {PERSIST_INTERVAL_SECS}\ndone",
            quote_path(&once)
        );
        let launch = format!(
            "exec -a {} bash {}",
            persist_process_name(&spec.job_uid),
            quote_path(&persist)
        );
        let script = [
            String::from("set -e"),
            format!("mkdir -p {}", quote_path(&sync_dir)),
            format!(
                "printf '%s\\n' {} > {}",
                quote(&self.sync_once_script(spec)),
                quote_path(&once)
            ),
            format!(
                "printf '%s\\n' {} > {}",
                quote(&loop_script),
                quote_path(&persist)
            ),
            format!("chmod +x {} {}", quote_path(&once), quote_path(&persist)),
            format!(
                "pkill -f {} || true",
                quote(&persist_process_pattern(&spec.job_uid))
            ),
            format!("nohup bash -c {} >/dev/null 2>&1 &", quote(&launch)),
        ]
        .join("\n");
        self.core
            .run("start_persist", &bash(&script), Self::vars(spec))
            .await
            .map(drop)
    }

    fn environment_name(spec: &JobSpec) -> String {
        format!("monkey-{}", spec.job_uid)
    }

    /// Prepares the job's environment and writes the activation file.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the environment cannot be built.
    pub async fn setup_dependency_manager(&self, spec: &JobSpec) -> Result<(), StepError> {
        let job_dir = self.layout.job_dir(&spec.job_uid);
        let env_name = Self::environment_name(spec);
        let env_file = spec
            .run
            .env_file
            .as_deref()
            .map(|file| quote_path(&job_dir.join(file)));
        let mut setup = vec![String::from("set -e")];
        let mut activate = Vec::new();

        match spec.run.env_type {
            EnvType::Conda => {
                setup.push(String::from("eval \"$(conda shell.bash hook)\""));
                match &env_file {
                    Some(file) => setup.push(format!(
                        "conda env create -q -n {env_name} -f {file} || conda env update -q -n {env_name} -f {file}"
                    )),
                    None => setup.push(format!(
                        "conda env list | grep -q '^{env_name} ' || conda create -y -q -n {env_name}"
                    )),
                }
                activate.push(String::from("eval \"$(conda shell.bash hook)\""));
                activate.push(format!("conda activate {env_name}"));
            }
            EnvType::Pip => {
                let venv = job_dir.join(".venv");
                setup.push(format!("python3 -m venv {}", quote_path(&venv)));
                if let Some(file) = &env_file {
                    setup.push(format!(
                        "{} install -q -r {file}",
                        quote_path(&venv.join("bin").join("pip"))
                    ));
                }
                activate.push(format!(
                    "source {}",
                    quote_path(&venv.join("bin").join("activate"))
                ));
            }
            EnvType::Docker => {
                let dockerfile = env_file.unwrap_or_else(|| quote_path(&job_dir.join("Dockerfile")));
                setup.push(format!(
                    "docker build -q -t {env_name} -f {dockerfile} {}",
                    quote_path(&job_dir)
                ));
                activate.push(format!("export MONKEY_DOCKER_IMAGE={env_name}"));
            }
        }
        for (key, value) in &spec.run.env {
            activate.push(format!("export {key}={}", quote(value)));
        }
        activate.push(format!("cd {}", quote_path(&job_dir)));

        setup.push(format!(
            "printf '%s\\n' {} > {}",
            quote(&activate.join("\n")),
            quote_path(&job_dir.join(ACTIVATE_FILE))
        ));
        let mut vars = Self::vars(spec);
        vars.insert(
            String::from("env_type"),
            serde_json::Value::String(spec.run.env_type.as_str().to_owned()),
        );
        self.core
            .run("setup_dependency_manager", &bash(&setup.join("\n")), vars)
            .await
            .map(drop)
    }

    /// Runs the job command through the activation file, tees its output to
    /// the run log, then syncs persisted folders before returning the
    /// command's status. Docker jobs get the exported `run.env` variables
    /// forwarded into the container.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the command exits non-zero.
    pub async fn execute_command(&self, spec: &JobSpec) -> Result<(), StepError> {
        let job_dir = self.layout.job_dir(&spec.job_uid);
        let command = match spec.run.env_type {
            EnvType::Docker => {
                let forwarded: String = spec
                    .run
                    .env
                    .keys()
                    .map(|key| format!("-e {} ", quote(key)))
                    .collect();
                format!(
                    "docker run --rm {forwarded}-v {dir}:{dir} -w {dir} \"$MONKEY_DOCKER_IMAGE\" bash -c {}",
                    quote(&spec.cmd),
                    dir = quote_path(&job_dir),
                )
            }
            EnvType::Conda | EnvType::Pip => spec.cmd.clone(),
        };
        let script = [
            format!("cd {}", quote_path(&job_dir)),
            format!("source {}", quote_path(&job_dir.join(ACTIVATE_FILE))),
            String::from("set -o pipefail"),
            format!(
                "( {command} ) 2>&1 | tee -a {}",
                quote_path(&self.log_file(&spec.job_uid))
            ),
            String::from("status=$?"),
            format!(
                "bash {}",
                quote_path(&self.sync_dir(&spec.job_uid).join("sync_once.sh"))
            ),
            String::from("exit $status"),
        ]
        .join("\n");
        self.core
            .run("execute_command", &bash(&script), Self::vars(spec))
            .await
            .map(drop)
    }

    /// Runs every setup step in order, stopping at the first failure:
    /// datasets, job directory and codebases, logs, persisted folders and the
    /// persistence loop, then the environment.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    pub async fn setup_job(&self, spec: &JobSpec) -> Result<(), StepError> {
        for item in &spec.data {
            self.setup_data_item(spec, item).await?;
        }
        self.unpack_job_dir(spec).await?;
        for item in &spec.code {
            self.unpack_code_and_persist(spec, item).await?;
        }
        self.setup_logs_folder(spec).await?;
        for folder in &spec.persist {
            self.setup_persist_folder(spec, folder).await?;
        }
        self.start_persist(spec).await?;
        self.setup_dependency_manager(spec).await
    }

    /// Stops the persistence loop and runs a final sync.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the remote shell fails.
    pub async fn stop_persist(&self, spec: &JobSpec) -> Result<(), StepError> {
        let script = format!(
            "pkill -f {} || true\nbash {} || true",
            quote(&persist_process_pattern(&spec.job_uid)),
            quote_path(&self.sync_dir(&spec.job_uid).join("sync_once.sh"))
        );
        self.core
            .run("stop_persist", &bash(&script), Self::vars(spec))
            .await
            .map(drop)
    }

    /// Reads the job's hyperparameter file without interrupting the
    /// command that may still be running on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] when the remote shell fails.
    pub async fn fetch_hyperparameters(
        &self,
        spec: &JobSpec,
    ) -> Result<Option<serde_json::Value>, StepError> {
        let path = self
            .layout
            .job_dir(&spec.job_uid)
            .join(HYPERPARAMETERS_FILE);
        let script = format!("cat {} 2>/dev/null || true", quote_path(&path));
        let outcome = self
            .core
            .read("fetch_hyperparameters", &bash(&script), Self::vars(spec))
            .await?;
        Ok(parse_hyperparameters(&outcome.events))
    }
}
