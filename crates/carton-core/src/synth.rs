//! Spec synthesis.
//!
//! Combines a resolved package version (or a hand-declared App) with
//! install-time overrides into one fingerprinted [`PipelineSpec`].

use crate::domain::error::{CartonError, Result};
use crate::domain::install::{AppSpec, InstallRequestSpec, ValueSource};
use crate::domain::package::PackageVersionSpec;
use crate::domain::pipeline::{PipelineSpec, PipelineTemplate, TemplateStep, ValuesStep};
use crate::domain::resource::Object;

/// Build the pipeline for an InstallRequest from its resolved version.
///
/// The template is deep-copied; the request's service account is written
/// into the deploy step; its value sources become a values step placed
/// ahead of the other template steps. Secret and ConfigMap references are
/// recorded, not read.
pub fn synthesize_install(
    version: &Object<PackageVersionSpec>,
    install: &Object<InstallRequestSpec>,
) -> Result<PipelineSpec> {
    assemble(
        install.name(),
        install.namespace(),
        &install.spec.service_account_name,
        &version.spec.template,
        &install.spec.values,
    )
    .map_err(|err| match err {
        CartonError::InvalidSpec(msg) => CartonError::InvalidSpec(format!(
            "package {} version {}: {msg}",
            version.spec.ref_name, version.spec.version
        )),
        other => other,
    })
}

/// Build the pipeline of a hand-declared App.
pub fn synthesize_app(app: &Object<AppSpec>) -> Result<PipelineSpec> {
    let template = PipelineTemplate {
        fetch: app.spec.fetch.clone(),
        template: app.spec.template.clone(),
        deploy: app.spec.deploy.clone(),
    };
    assemble(
        app.name(),
        app.namespace(),
        &app.spec.service_account_name,
        &template,
        &app.spec.values,
    )
}

fn assemble(
    app_name: &str,
    namespace: &str,
    service_account: &str,
    template: &PipelineTemplate,
    values: &[ValueSource],
) -> Result<PipelineSpec> {
    if service_account.trim().is_empty() {
        return Err(CartonError::InvalidSpec(
            "serviceAccountName is required".to_string(),
        ));
    }
    if template.fetch.is_empty() {
        return Err(CartonError::InvalidSpec(
            "template declares no fetch stage".to_string(),
        ));
    }
    let deploy = match template.deploy.as_slice() {
        [only] => only.clone().with_service_account(service_account),
        [] => {
            return Err(CartonError::InvalidSpec(
                "template declares no deploy stage".to_string(),
            ))
        }
        many => {
            return Err(CartonError::InvalidSpec(format!(
                "template declares {} deploy stages; exactly one is supported",
                many.len()
            )))
        }
    };
    if template
        .template
        .iter()
        .any(|step| matches!(step, TemplateStep::Values(_)))
    {
        return Err(CartonError::InvalidSpec(
            "values steps are generated from value sources and may not be declared".to_string(),
        ));
    }

    let mut steps = Vec::with_capacity(template.template.len() + 1);
    if !values.is_empty() {
        steps.push(TemplateStep::Values(ValuesStep {
            sources: values.to_vec(),
        }));
    }
    steps.extend(template.template.iter().cloned());

    PipelineSpec::new(
        app_name,
        namespace,
        service_account,
        template.fetch.clone(),
        steps,
        deploy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::install::{DataRef, PackageRef};
    use crate::domain::pipeline::{
        DeployStep, FetchSource, ImgpkgBundleSource, KappDeployStep, YttStep,
    };
    use chrono::Utc;
    use serde_json::json;

    fn version(template: PipelineTemplate) -> Object<PackageVersionSpec> {
        Object::new(
            "default",
            "demo.1.0.0",
            PackageVersionSpec {
                ref_name: "demo".into(),
                version: "1.0.0".into(),
                released_at: Some(Utc::now()),
                licenses: vec!["Apache-2.0".into()],
                release_notes: "initial".into(),
                capacity_requirements_description: String::new(),
                template,
            },
        )
    }

    fn template() -> PipelineTemplate {
        PipelineTemplate {
            fetch: vec![FetchSource::ImgpkgBundle(ImgpkgBundleSource {
                image: "registry.example.com/demo:1.0.0".into(),
                secret_ref: None,
            })],
            template: vec![TemplateStep::Ytt(YttStep::default())],
            deploy: vec![DeployStep::Kapp(KappDeployStep::default())],
        }
    }

    fn install(values: Vec<ValueSource>) -> Object<InstallRequestSpec> {
        Object::new(
            "default",
            "demo",
            InstallRequestSpec {
                service_account_name: "installer".into(),
                package_ref: PackageRef::named("demo"),
                values,
                sync_period: None,
                paused: false,
            },
        )
    }

    fn secret(name: &str) -> ValueSource {
        ValueSource::SecretRef(DataRef {
            name: name.into(),
            key: None,
        })
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let a = synthesize_install(&version(template()), &install(vec![secret("v")])).unwrap();
        let mut newer = version(template());
        newer.spec.released_at = Some(Utc::now() + chrono::Duration::days(1));
        let b = synthesize_install(&newer, &install(vec![secret("v")])).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_value_reference_changes_fingerprint() {
        let a = synthesize_install(&version(template()), &install(vec![secret("v1")])).unwrap();
        let b = synthesize_install(&version(template()), &install(vec![secret("v2")])).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_values_step_precedes_templates_and_account_is_substituted() {
        let spec = synthesize_install(
            &version(template()),
            &install(vec![ValueSource::Inline(json!({"replicas": 2}))]),
        )
        .unwrap();
        assert!(matches!(spec.template[0], TemplateStep::Values(_)));
        assert!(matches!(spec.template[1], TemplateStep::Ytt(_)));
        assert_eq!(spec.value_sources().len(), 1);
        let DeployStep::Kapp(kapp) = &spec.deploy;
        assert_eq!(kapp.service_account_name.as_deref(), Some("installer"));
    }

    #[test]
    fn test_no_values_no_values_step() {
        let spec = synthesize_install(&version(template()), &install(vec![])).unwrap();
        assert_eq!(spec.template.len(), 1);
    }

    #[test]
    fn test_missing_deploy_is_invalid() {
        let mut t = template();
        t.deploy.clear();
        let err = synthesize_install(&version(t), &install(vec![])).unwrap_err();
        assert!(matches!(err, CartonError::InvalidSpec(ref m) if m.contains("no deploy stage")));
    }

    #[test]
    fn test_missing_service_account_is_invalid() {
        let mut request = install(vec![]);
        request.spec.service_account_name.clear();
        assert!(synthesize_install(&version(template()), &request).is_err());
    }
}
