use core::fmt;
use std::net::SocketAddr;

use camino::{Utf8Path, Utf8PathBuf};

pub const DEFAULT_API_URL: &str = "https://api.abeja.io";
pub const DEFAULT_HTTP_LISTEN_PORT: u16 = 5000;
pub const DEFAULT_HEALTH_CHECK_LISTEN_PORT: u16 = 5001;
pub const DEFAULT_RUNTIME: &str = "python36";
pub const DEFAULT_MOUNT_TARGET_DIR: &str = "/mnt";

/// Name of the directory holding training artifacts, relative to the
/// working directory unless overridden with an absolute path.
pub const DEFAULT_TRAINING_RESULT_DIR: &str = "abejainc_training_result";

/// Options resolved from command-line flags and environment variables.
#[derive(Clone)]
pub struct Conf {
    pub api_url: String,
    pub organization_id: String,
    pub model_id: String,
    pub model_version: String,
    pub model_version_id: String,
    pub deployment_id: String,
    pub service_id: String,
    pub deployment_code_download: String,
    pub training_model_download: String,
    pub user_model_root: String,
    pub platform_auth_token: String,
    pub platform_user_id: String,
    pub platform_personal_access_token: String,
    pub training_job_id: String,
    pub training_job_ids: String,
    pub training_job_definition_name: String,
    pub training_job_definition_version: i64,
    pub tensorboard_id: String,
    pub mount_target_dir: String,
    pub run_id: String,
    pub runtime: String,
    pub requested_data_dir: Utf8PathBuf,
    pub port: u16,
    pub health_check_port: u16,
    pub training_result_dir: String,
    pub input: String,
    pub output: String,
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            api_url: DEFAULT_API_URL.to_owned(),
            organization_id: String::new(),
            model_id: String::new(),
            model_version: String::new(),
            model_version_id: String::new(),
            deployment_id: String::new(),
            service_id: String::new(),
            deployment_code_download: String::new(),
            training_model_download: String::new(),
            user_model_root: String::new(),
            platform_auth_token: String::new(),
            platform_user_id: String::new(),
            platform_personal_access_token: String::new(),
            training_job_id: String::new(),
            training_job_ids: String::new(),
            training_job_definition_name: String::new(),
            training_job_definition_version: 0,
            tensorboard_id: String::new(),
            mount_target_dir: DEFAULT_MOUNT_TARGET_DIR.to_owned(),
            run_id: String::new(),
            runtime: DEFAULT_RUNTIME.to_owned(),
            requested_data_dir: default_requested_data_dir(),
            port: DEFAULT_HTTP_LISTEN_PORT,
            health_check_port: DEFAULT_HEALTH_CHECK_LISTEN_PORT,
            training_result_dir: DEFAULT_TRAINING_RESULT_DIR.to_owned(),
            input: String::new(),
            output: String::new(),
        }
    }
}

/// Process-scoped directory for per-request body files; unique per proxy
/// instance so two pods sharing a volume never collide.
fn default_requested_data_dir() -> Utf8PathBuf {
    let tmp = std::env::temp_dir();
    let tmp = Utf8PathBuf::from_path_buf(tmp).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
    tmp.join(format!("model-proxy-data-{}", uuid::Uuid::new_v4()))
}

impl Conf {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn health_check_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.health_check_port))
    }

    /// Absolute path of the directory holding the user code.
    pub fn working_dir(&self) -> anyhow::Result<Utf8PathBuf> {
        resolve_working_dir(&self.user_model_root)
    }

    /// Absolute path of the directory receiving training artifacts.
    pub fn training_result_dir_path(&self) -> anyhow::Result<Utf8PathBuf> {
        if Utf8Path::new(&self.training_result_dir).is_absolute() {
            return Ok(Utf8PathBuf::from(&self.training_result_dir));
        }
        let working_dir = self.working_dir()?;
        if self.training_result_dir.is_empty() {
            Ok(working_dir.join(DEFAULT_TRAINING_RESULT_DIR))
        } else {
            Ok(working_dir.join(&self.training_result_dir))
        }
    }

    pub fn auth_info(&self) -> AuthInfo {
        // compensate the 'user-' prefix expected by the platform API
        let user_id = if !self.platform_user_id.is_empty() && !self.platform_user_id.starts_with("user-") {
            format!("user-{}", self.platform_user_id)
        } else {
            self.platform_user_id.clone()
        };
        AuthInfo {
            auth_token: self.platform_auth_token.clone(),
            user_id,
            personal_token: self.platform_personal_access_token.clone(),
        }
    }
}

fn resolve_working_dir(user_root: &str) -> anyhow::Result<Utf8PathBuf> {
    if Utf8Path::new(user_root).is_absolute() {
        return Ok(Utf8PathBuf::from(user_root));
    }
    let current = std::env::current_dir()?;
    let current =
        Utf8PathBuf::from_path_buf(current).map_err(|path| anyhow::anyhow!("non UTF-8 working directory: {path:?}"))?;
    if user_root.is_empty() {
        Ok(current)
    } else {
        Ok(current.join(user_root))
    }
}

impl fmt::Debug for Conf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conf")
            .field("api_url", &self.api_url)
            .field("organization_id", &self.organization_id)
            .field("model_id", &self.model_id)
            .field("model_version", &self.model_version)
            .field("model_version_id", &self.model_version_id)
            .field("deployment_id", &self.deployment_id)
            .field("service_id", &self.service_id)
            .field("deployment_code_download", &self.deployment_code_download)
            .field("training_model_download", &self.training_model_download)
            .field("user_model_root", &self.user_model_root)
            .field("platform_auth_token", &redact(&self.platform_auth_token))
            .field("platform_user_id", &self.platform_user_id)
            .field(
                "platform_personal_access_token",
                &redact(&self.platform_personal_access_token),
            )
            .field("training_job_id", &self.training_job_id)
            .field("training_job_ids", &self.training_job_ids)
            .field("training_job_definition_name", &self.training_job_definition_name)
            .field("training_job_definition_version", &self.training_job_definition_version)
            .field("tensorboard_id", &self.tensorboard_id)
            .field("mount_target_dir", &self.mount_target_dir)
            .field("run_id", &self.run_id)
            .field("runtime", &self.runtime)
            .field("requested_data_dir", &self.requested_data_dir)
            .field("port", &self.port)
            .field("health_check_port", &self.health_check_port)
            .field("training_result_dir", &self.training_result_dir)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "xxxxxxxxxx" }
}

/// Credentials for the platform API: a bearer token, or a
/// (user id, personal access token) pair for basic auth.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub auth_token: String,
    pub user_id: String,
    pub personal_token: String,
}

pub fn validate_port_number(port: u16) -> anyhow::Result<()> {
    if port < 1024 {
        anyhow::bail!("port [{port}] must be greater than 1023 and less than 65536");
    }
    Ok(())
}

pub fn validate_training_job_definition_version(version: i64) -> anyhow::Result<()> {
    if version < 1 {
        anyhow::bail!("training_job_definition_version [{version}] must be greater than 0");
    }
    Ok(())
}

pub fn validate_auth_parts(conf: &Conf) -> anyhow::Result<()> {
    if conf.platform_auth_token.is_empty()
        && (conf.platform_user_id.is_empty() || conf.platform_personal_access_token.is_empty())
    {
        anyhow::bail!(
            "platform_auth_token or (abeja_platform_user_id and abeja_platform_personal_access_token) need but not set."
        );
    }
    Ok(())
}

pub fn validate_serving_code(conf: &Conf) -> anyhow::Result<()> {
    if !conf.deployment_code_download.is_empty() {
        return Ok(());
    }
    if !conf.organization_id.is_empty() && !conf.model_id.is_empty() && !conf.model_version_id.is_empty() {
        return Ok(());
    }
    anyhow::bail!(
        "abeja_deployment_code_download or (abeja_organization_id and abeja_model_id and abeja_model_version_id) need but not set."
    );
}

pub fn validate_trained_model(conf: &Conf) -> anyhow::Result<()> {
    if conf.training_model_download.is_empty()
        && conf.training_job_definition_name.is_empty()
        && conf.training_job_id.is_empty()
    {
        return Ok(());
    }
    if !conf.training_model_download.is_empty() {
        return Ok(());
    }
    if !conf.organization_id.is_empty()
        && !conf.training_job_definition_name.is_empty()
        && !conf.training_job_id.is_empty()
    {
        return Ok(());
    }
    anyhow::bail!(
        "When using the training result, please specify abeja_training_model_download or (abeja_organization_id, training_job_definition_name and training_job_id)."
    );
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1024, true)]
    #[case(5000, true)]
    #[case(65535, true)]
    #[case(1023, false)]
    #[case(80, false)]
    fn port_validation(#[case] port: u16, #[case] ok: bool) {
        assert_eq!(validate_port_number(port).is_ok(), ok);
    }

    #[test]
    fn auth_needs_token_or_pair() {
        let mut conf = Conf::default();
        assert!(validate_auth_parts(&conf).is_err());

        conf.platform_auth_token = "token".to_owned();
        assert!(validate_auth_parts(&conf).is_ok());

        conf.platform_auth_token.clear();
        conf.platform_user_id = "1234567890123".to_owned();
        assert!(validate_auth_parts(&conf).is_err());

        conf.platform_personal_access_token = "secret".to_owned();
        assert!(validate_auth_parts(&conf).is_ok());
    }

    #[test]
    fn serving_code_accepts_either_shape() {
        let mut conf = Conf::default();
        assert!(validate_serving_code(&conf).is_err());

        conf.deployment_code_download = "organizations/1/deployments/2/code".to_owned();
        assert!(validate_serving_code(&conf).is_ok());

        conf.deployment_code_download.clear();
        conf.organization_id = "1".to_owned();
        conf.model_id = "2".to_owned();
        conf.model_version_id = "3".to_owned();
        assert!(validate_serving_code(&conf).is_ok());
    }

    #[rstest]
    #[case("", "", "", true)] // not using a training result at all
    #[case("organizations/1/models", "", "", true)]
    #[case("", "def", "", false)] // definition name without job id
    #[case("", "def", "job-1", false)] // missing organization id
    fn trained_model_combinations(
        #[case] download: &str,
        #[case] definition: &str,
        #[case] job: &str,
        #[case] ok: bool,
    ) {
        let conf = Conf {
            training_model_download: download.to_owned(),
            training_job_definition_name: definition.to_owned(),
            training_job_id: job.to_owned(),
            ..Conf::default()
        };
        assert_eq!(validate_trained_model(&conf).is_ok(), ok);
    }

    #[test]
    fn user_id_gains_the_user_prefix() {
        let conf = Conf {
            platform_user_id: "1234567890123".to_owned(),
            ..Conf::default()
        };
        assert_eq!(conf.auth_info().user_id, "user-1234567890123");

        let conf = Conf {
            platform_user_id: "user-1234567890123".to_owned(),
            ..Conf::default()
        };
        assert_eq!(conf.auth_info().user_id, "user-1234567890123");
    }

    #[test]
    fn training_result_dir_resolution() {
        let conf = Conf {
            training_result_dir: "/abs/result".to_owned(),
            ..Conf::default()
        };
        assert_eq!(
            conf.training_result_dir_path().expect("resolve"),
            Utf8PathBuf::from("/abs/result")
        );

        let conf = Conf {
            user_model_root: "/srv/model".to_owned(),
            ..Conf::default()
        };
        assert_eq!(
            conf.training_result_dir_path().expect("resolve"),
            Utf8PathBuf::from("/srv/model").join(DEFAULT_TRAINING_RESULT_DIR)
        );
    }

    #[test]
    fn secrets_are_redacted_from_debug_output() {
        let conf = Conf {
            platform_auth_token: "super-secret".to_owned(),
            platform_personal_access_token: "also-secret".to_owned(),
            ..Conf::default()
        };
        let debug = format!("{conf:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("also-secret"));
        assert!(debug.contains("xxxxxxxxxx"));
    }
}
