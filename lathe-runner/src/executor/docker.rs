//! Built-in runner: run the job's image with its command line
//!
//! The container sees two mounts:
//! - `/output`, a fresh directory inside the job directory whose content
//!   is zipped and uploaded as the `output` artifact
//! - `/cache`, the node-wide cache directory
//!
//! Output lines containing `NN%` are reported as progress.

use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result, anyhow};
use async_trait::async_trait;
use lathe_core::domain::docker::DockerImageSpec;

use super::RunError;
use super::registry::{JobRunner, RunnerFactory};
use super::spec::JobSpec;
use crate::artifact::StripPath;
use crate::container::ContainerRunner;
use crate::context::JobContext;
use crate::progress::PercentProgressParser;

pub const OUTPUT_NAME: &str = "output";
pub const OUTPUT_TYPE: &str = "zip";

pub struct DockerRunnerFactory;

impl RunnerFactory for DockerRunnerFactory {
    fn create(&self, spec: &JobSpec) -> Result<Box<dyn JobRunner>> {
        let image = spec.image.clone().ok_or_else(|| {
            anyhow!(
                "Template '{}' does not name a docker image",
                spec.template.name
            )
        })?;
        let command = spec.command()?;
        Ok(Box::new(DockerRunner { image, command }))
    }
}

pub struct DockerRunner {
    image: DockerImageSpec,
    command: Vec<String>,
}

impl DockerRunner {
    pub fn new(image: DockerImageSpec, command: Vec<String>) -> Self {
        Self { image, command }
    }
}

#[async_trait]
impl JobRunner for DockerRunner {
    async fn do_run(
        &self,
        ctx: &mut JobContext,
        containers: &ContainerRunner,
    ) -> Result<(), RunError> {
        let job_dir = ctx.ensure_job_dir()?;
        let output_dir = job_dir.join(OUTPUT_NAME);
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let volumes = vec![
            format!("{}:/output", output_dir.display()),
            format!("{}:/cache", ctx.settings().cache_dir.display()),
        ];

        let result = containers
            .run(
                ctx,
                &self.image,
                &[],
                &volumes,
                &self.command,
                Some(&PercentProgressParser),
            )
            .await;
        result.check("Container")?;

        let files = collect_files(&output_dir)?;
        let packager = ctx.packager();
        packager
            .compress_and_upload(
                ctx,
                OUTPUT_NAME,
                OUTPUT_TYPE,
                &files,
                &job_dir.join("output.zip"),
                StripPath::Prefix(output_dir),
            )
            .await;

        Ok(())
    }
}

/// All regular files below `dir`, sorted
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read {}", current.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lathe_core::domain::job::{Job, TemplateRef};
    use lathe_core::domain::template::{Template, TemplateParameter};
    use serde_json::json;
    use std::collections::HashMap;

    fn image() -> DockerImageSpec {
        DockerImageSpec {
            pk: 3,
            name: "trainer".to_string(),
            version: "1.0".to_string(),
            url: "registry.example.com/trainer:1.0".to_string(),
            registry_url: "registry.example.com".to_string(),
            registry_username: None,
            registry_password: None,
            cpu: true,
            cuda_version: None,
            min_hardware_generation: None,
        }
    }

    fn spec(body: serde_json::Value, image: Option<DockerImageSpec>) -> JobSpec {
        let mut parameters = HashMap::new();
        parameters.insert(
            "body".to_string(),
            TemplateParameter {
                default: Some(body),
                default_type: None,
                types: vec![],
                help: String::new(),
            },
        );
        let job = Job {
            pk: 5,
            template: TemplateRef { pk: 1, name: None },
            input_values: Default::default(),
            parameter_values: Default::default(),
            node: None,
            start_time: None,
            end_time: None,
            error_reason: None,
            is_cancelled: false,
            docker_image: None,
        };
        let template = Template {
            pk: 1,
            name: "train".to_string(),
            version: 1,
            contract: "Train<ImageClassification>".to_string(),
            parameters,
            description: String::new(),
        };
        JobSpec::build(job, template, image).unwrap()
    }

    #[test]
    fn test_factory_requires_image() {
        let err = DockerRunnerFactory
            .create(&spec(json!("train"), None))
            .err()
            .unwrap();
        assert!(err.to_string().contains("does not name a docker image"));
        assert!(DockerRunnerFactory.create(&spec(json!("train"), Some(image()))).is_ok());
    }

    #[test]
    fn test_factory_validates_command() {
        let result = DockerRunnerFactory.create(&spec(json!("train ${missing}"), Some(image())));
        assert!(result.is_err());
    }

    #[test]
    fn test_collect_files_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("sub/deeper/c.bin"), "c").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let relative: Vec<_> = files
            .iter()
            .map(|f| f.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(relative, vec!["b.txt", "sub/a.txt", "sub/deeper/c.bin"]);
    }
}
