//! Typed job specification
//!
//! A [`JobSpec`] bundles a job with its template and docker image and
//! resolves every template parameter up front: the job's own value wins,
//! then the template default. A job that leaves a parameter without either
//! is rejected before anything runs.
//!
//! Command templates use `${name}` placeholders. `${+name:text}` yields
//! `text` when the boolean parameter is true and `${-name:text}` when it is
//! false; arguments that expand to nothing are dropped.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use lathe_core::domain::docker::DockerImageSpec;
use lathe_core::domain::job::Job;
use lathe_core::domain::template::Template;
use serde_json::Value;

/// Parameter holding the docker image of docker-based templates
pub const DOCKER_IMAGE_PARAMETER: &str = "docker_image";

/// Parameter holding the command template of the built-in runner
pub const BODY_PARAMETER: &str = "body";

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job: Job,
    pub template: Template,
    pub image: Option<DockerImageSpec>,
    values: BTreeMap<String, Value>,
}

impl JobSpec {
    /// Resolves all parameter values of a job
    ///
    /// # Arguments
    /// * `job` - The job as listed by the backend
    /// * `template` - The job's template
    /// * `image` - The docker image, for docker-based templates
    pub fn build(job: Job, template: Template, image: Option<DockerImageSpec>) -> Result<Self> {
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();

        for (name, parameter) in &template.parameters {
            match job
                .value(name)
                .map(|typed| typed.value.clone())
                .or_else(|| parameter.default.clone())
            {
                Some(value) => {
                    values.insert(name.clone(), value);
                }
                None => missing.push(name.as_str()),
            }
        }

        if !missing.is_empty() {
            missing.sort_unstable();
            bail!(
                "Job {} has no value for required parameter(s): {}",
                job.pk,
                missing.join(", ")
            );
        }

        // Values the template does not declare are kept for the runners
        for (name, typed) in job.input_values.iter().chain(job.parameter_values.iter()) {
            values.entry(name.clone()).or_insert_with(|| typed.value.clone());
        }

        Ok(Self {
            job,
            template,
            image,
            values,
        })
    }

    pub fn pk(&self) -> i64 {
        self.job.pk
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn bool_value(&self, name: &str) -> Option<bool> {
        self.value(name).and_then(as_bool)
    }

    /// The expanded command template, one entry per argument
    ///
    /// A string body is split on whitespace; an array body is used as-is.
    pub fn command(&self) -> Result<Vec<String>> {
        let body = self
            .value(BODY_PARAMETER)
            .ok_or_else(|| anyhow!("Template '{}' has no '{}' parameter", self.template.name, BODY_PARAMETER))?;

        let arguments: Vec<String> = match body {
            Value::String(text) => text.split_whitespace().map(str::to_string).collect(),
            Value::Array(items) => items.iter().map(render).collect(),
            other => bail!("Parameter '{}' must be a string or a list, got {}", BODY_PARAMETER, other),
        };

        let mut expanded = Vec::with_capacity(arguments.len());
        for argument in arguments {
            let argument = expand(&argument, &self.values)?;
            if !argument.is_empty() {
                expanded.push(argument);
            }
        }
        Ok(expanded)
    }
}

/// Primary key of the docker image a job runs in, if any
///
/// The value may be the key itself, a numeric string, or an object with a
/// `pk` field.
pub fn docker_image_pk(job: &Job, template: Option<&Template>) -> Option<i64> {
    let value = job
        .value(DOCKER_IMAGE_PARAMETER)
        .map(|typed| &typed.value)
        .or_else(|| {
            template?
                .parameters
                .get(DOCKER_IMAGE_PARAMETER)?
                .default
                .as_ref()
        })?;

    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        Value::Object(object) => object.get("pk")?.as_i64(),
        _ => None,
    }
}

/// Replaces all placeholders in a single argument
pub fn expand(argument: &str, values: &BTreeMap<String, Value>) -> Result<String> {
    let mut result = String::with_capacity(argument.len());
    let mut rest = argument;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow!("Unterminated placeholder in '{}'", argument))?;
        result.push_str(&substitute(&after[..end], values)?);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn substitute(placeholder: &str, values: &BTreeMap<String, Value>) -> Result<String> {
    let lookup = |name: &str| {
        values
            .get(name)
            .ok_or_else(|| anyhow!("Unknown parameter '{}' in command template", name))
    };

    let (wanted, switch) = match placeholder.strip_prefix('+') {
        Some(switch) => (true, switch),
        None => match placeholder.strip_prefix('-') {
            Some(switch) => (false, switch),
            None => return Ok(render(lookup(placeholder)?)),
        },
    };

    let (name, text) = switch
        .split_once(':')
        .ok_or_else(|| anyhow!("Switch placeholder '${{{}}}' needs the form name:text", placeholder))?;
    let flag = as_bool(lookup(name)?)
        .ok_or_else(|| anyhow!("Parameter '{}' is not a boolean", name))?;

    Ok(if flag == wanted { text.to_string() } else { String::new() })
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) if text.eq_ignore_ascii_case("true") => Some(true),
        Value::String(text) if text.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lathe_core::domain::job::{TemplateRef, TypedValue};
    use lathe_core::domain::template::TemplateParameter;
    use serde_json::json;
    use std::collections::HashMap;

    fn parameter(default: Option<Value>) -> TemplateParameter {
        TemplateParameter {
            default,
            default_type: None,
            types: vec![],
            help: String::new(),
        }
    }

    fn template(parameters: Vec<(&str, Option<Value>)>) -> Template {
        Template {
            pk: 5,
            name: "train".to_string(),
            version: 1,
            contract: "Train<Domain>".to_string(),
            parameters: parameters
                .into_iter()
                .map(|(name, default)| (name.to_string(), parameter(default)))
                .collect(),
            description: String::new(),
        }
    }

    fn job(values: Vec<(&str, Value)>) -> Job {
        Job {
            pk: 42,
            template: TemplateRef { pk: 5, name: None },
            input_values: HashMap::new(),
            parameter_values: values
                .into_iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        TypedValue {
                            value,
                            value_type: "str".to_string(),
                        },
                    )
                })
                .collect(),
            node: None,
            start_time: None,
            end_time: None,
            error_reason: None,
            is_cancelled: false,
            docker_image: None,
        }
    }

    #[test]
    fn test_job_values_override_defaults() {
        let spec = JobSpec::build(
            job(vec![("epochs", json!(20))]),
            template(vec![("epochs", Some(json!(10))), ("lr", Some(json!(0.1)))]),
            None,
        )
        .unwrap();
        assert_eq!(spec.value("epochs"), Some(&json!(20)));
        assert_eq!(spec.value("lr"), Some(&json!(0.1)));
    }

    #[test]
    fn test_missing_required_parameters_fail_eagerly() {
        let err = JobSpec::build(
            job(vec![]),
            template(vec![("model", None), ("data", None), ("epochs", Some(json!(1)))]),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Job 42 has no value for required parameter(s): data, model"
        );
    }

    #[test]
    fn test_command_expansion() {
        let spec = JobSpec::build(
            job(vec![("epochs", json!(3)), ("verbose", json!(true))]),
            template(vec![
                ("body", Some(json!(["train.py", "--epochs=${epochs}", "${+verbose:-v}", "${-verbose:--quiet}"]))),
                ("epochs", Some(json!(1))),
                ("verbose", Some(json!(false))),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(spec.command().unwrap(), vec!["train.py", "--epochs=3", "-v"]);
    }

    #[test]
    fn test_string_body_is_split() {
        let spec = JobSpec::build(
            job(vec![]),
            template(vec![("body", Some(json!("predict.py  --model ${model}"))), ("model", Some(json!("resnet")))]),
            None,
        )
        .unwrap();
        assert_eq!(spec.command().unwrap(), vec!["predict.py", "--model", "resnet"]);
    }

    #[test]
    fn test_expand_errors() {
        let values = BTreeMap::from([("flag".to_string(), json!("maybe"))]);
        assert!(expand("${unknown}", &values).is_err());
        assert!(expand("${flag", &values).is_err());
        assert!(expand("${+flag:x}", &values).is_err());
        assert!(expand("${+flag}", &values).is_err());
        assert_eq!(expand("plain", &values).unwrap(), "plain");
    }

    #[test]
    fn test_docker_image_pk_forms() {
        assert_eq!(docker_image_pk(&job(vec![("docker_image", json!(3))]), None), Some(3));
        assert_eq!(docker_image_pk(&job(vec![("docker_image", json!("4"))]), None), Some(4));
        assert_eq!(
            docker_image_pk(&job(vec![("docker_image", json!({"pk": 5, "name": "x"}))]), None),
            Some(5)
        );
        let with_default = template(vec![("docker_image", Some(json!(6)))]);
        assert_eq!(docker_image_pk(&job(vec![]), Some(&with_default)), Some(6));
        assert_eq!(docker_image_pk(&job(vec![]), None), None);
    }
}
