#![allow(clippy::print_stderr)]

#[macro_use]
extern crate tracing;

use std::env;
use std::future::Future;

use anyhow::Context as _;
use model_proxy::config::{
    self, Conf, validate_auth_parts, validate_port_number, validate_serving_code, validate_trained_model,
    validate_training_job_definition_version,
};
use model_proxy::log::LoggerGuard;
use model_proxy::{PROXY_VERSION, batch, log, preprocess, service, tensorboard, train};
use seahorse::{App, Command, Context, Flag, FlagType};

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(generate_usage())
        .command(service_command())
        .command(train_command())
        .command(batch_command())
        .command(tensorboard_command());

    app.run(env::args().collect());
}

fn generate_usage() -> String {
    format!(
        "{command} [subcommand]\n\
        \n\
        \tEvery option is accepted as a flag or as its environment variable\n\
        \t(--abeja_organization_id / ABEJA_ORGANIZATION_ID); flags win.\n\
        \n\
        \tExamples:\n\
        \n\
        \t  {command} service\n\
        \t  {command} train download\n\
        \t  {command} batch run --input '{{\"$datalake:1\":\"<channel>/<file>\"}}'\n",
        command = env!("CARGO_PKG_NAME"),
    )
}

fn service_command() -> Command {
    with_common_flags(
        Command::new("service")
            .description("download user model/training-result and run model")
            .usage("model-proxy service [download|run]")
            .action(service_action),
    )
}

fn train_command() -> Command {
    with_common_flags(
        Command::new("train")
            .description("download training code and run a training job")
            .usage("model-proxy train [download|train]")
            .action(train_action),
    )
}

fn batch_command() -> Command {
    with_common_flags(
        Command::new("batch")
            .description("run one batch request against the model")
            .usage("model-proxy batch [run]")
            .action(batch_action),
    )
}

fn tensorboard_command() -> Command {
    with_common_flags(
        Command::new("tensorboard")
            .description("download training job results for tensorboard")
            .usage("model-proxy tensorboard")
            .action(tensorboard_action),
    )
}

fn service_action(c: &Context) {
    run_action(c, |c, conf| {
        validate_service(&conf)?;
        match subcommand(c)? {
            None => {
                info!(version = PROXY_VERSION, "start download & serve");
                run_blocking(service::run(conf, true))
            }
            Some("download") => run_blocking(async move { preprocess::prepare(&conf).await }),
            Some("run") => run_blocking(service::run(conf, false)),
            Some(other) => anyhow::bail!("unknown subcommand: {other}"),
        }
    });
}

fn train_action(c: &Context) {
    run_action(c, |c, conf| {
        match subcommand(c)? {
            None => {
                validate_train(&conf)?;
                run_blocking(async move {
                    train::download(conf.clone()).await?;
                    train::run(conf).await
                })
            }
            Some("download") => {
                validate_train(&conf)?;
                run_blocking(train::download(conf))
            }
            Some("train") => {
                validate_train_run(&conf)?;
                run_blocking(train::run(conf))
            }
            Some(other) => anyhow::bail!("unknown subcommand: {other}"),
        }
    });
}

fn batch_action(c: &Context) {
    run_action(c, |c, conf| {
        validate_batch(&conf)?;
        match subcommand(c)? {
            None => run_blocking(batch::run(conf, true)),
            Some("run") => run_blocking(batch::run(conf, false)),
            Some(other) => anyhow::bail!("unknown subcommand: {other}"),
        }
    });
}

fn tensorboard_action(c: &Context) {
    run_action(c, |_c, conf| {
        validate_tensorboard(&conf)?;
        run_blocking(tensorboard::run(conf))
    });
}

fn run_action(c: &Context, mode: fn(&Context, Conf) -> anyhow::Result<()>) {
    let guard = match log::init() {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to initialize logging: {error:#}");
            std::process::exit(1);
        }
    };

    let result = build_conf(c).and_then(|conf| mode(c, conf));
    exit_with(guard, result);
}

fn exit_with(guard: LoggerGuard, result: anyhow::Result<()>) -> ! {
    let code = match result {
        Ok(()) => 0,
        Err(error) => {
            error!(error = format!("{error:#}"), "command failed");
            1
        }
    };
    drop(guard);
    std::process::exit(code);
}

fn subcommand(c: &Context) -> anyhow::Result<Option<&str>> {
    match c.args.as_slice() {
        [] => Ok(None),
        [sub] => Ok(Some(sub.as_str())),
        more => anyhow::bail!("too many arguments: {more:?}"),
    }
}

fn run_blocking<F>(fut: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?
        .block_on(fut)
}

struct Opt {
    flag: &'static str,
    env: &'static str,
    default: &'static str,
    description: &'static str,
}

const STRING_OPTS: &[Opt] = &[
    Opt { flag: "abeja_api_url", env: "ABEJA_API_URL", default: config::DEFAULT_API_URL, description: "base url of abeja-api" },
    Opt { flag: "abeja_organization_id", env: "ABEJA_ORGANIZATION_ID", default: "", description: "identifier of organization" },
    Opt { flag: "abeja_model_id", env: "ABEJA_MODEL_ID", default: "", description: "identifier of model" },
    Opt { flag: "abeja_model_version", env: "ABEJA_MODEL_VERSION", default: "", description: "model version" },
    Opt { flag: "abeja_model_version_id", env: "ABEJA_MODEL_VERSION_ID", default: "", description: "identifier of model version" },
    Opt { flag: "abeja_deployment_id", env: "ABEJA_DEPLOYMENT_ID", default: "", description: "identifier of deployment" },
    Opt { flag: "abeja_service_id", env: "ABEJA_SERVICE_ID", default: "", description: "identifier of service" },
    Opt { flag: "abeja_deployment_code_download", env: "ABEJA_DEPLOYMENT_CODE_DOWNLOAD", default: "", description: "deployment code download path" },
    Opt { flag: "abeja_training_model_download", env: "ABEJA_TRAINING_MODEL_DOWNLOAD", default: "", description: "training model download path" },
    Opt { flag: "abeja_user_model_root", env: "ABEJA_USER_MODEL_ROOT", default: "", description: "root path of the directory where the user model is located" },
    Opt { flag: "platform_auth_token", env: "PLATFORM_AUTH_TOKEN", default: "", description: "authentication token for platform" },
    Opt { flag: "abeja_platform_user_id", env: "ABEJA_PLATFORM_USER_ID", default: "", description: "identifier of user" },
    Opt { flag: "abeja_platform_personal_access_token", env: "ABEJA_PLATFORM_PERSONAL_ACCESS_TOKEN", default: "", description: "personal access token of user" },
    Opt { flag: "training_job_id", env: "TRAINING_JOB_ID", default: "", description: "identifier of training job" },
    Opt { flag: "training_job_ids", env: "TRAINING_JOB_IDS", default: "", description: "comma separated list of identifier of training job" },
    Opt { flag: "training_job_definition_name", env: "TRAINING_JOB_DEFINITION_NAME", default: "", description: "name of training job definition" },
    Opt { flag: "tensorboard_id", env: "TENSORBOARD_ID", default: "", description: "identifier of tensorboard" },
    Opt { flag: "mount_target_dir", env: "ABEJA_MOUNT_TARGET_DIR", default: config::DEFAULT_MOUNT_TARGET_DIR, description: "directory to mount shared file system" },
    Opt { flag: "abeja_run_id", env: "ABEJA_RUN_ID", default: "", description: "identifier of run" },
    Opt { flag: "abeja_runtime", env: "ABEJA_RUNTIME", default: config::DEFAULT_RUNTIME, description: "runtime language of inference service" },
    Opt { flag: "abeja_training_result_dir", env: "ABEJA_TRAINING_RESULT_DIR", default: config::DEFAULT_TRAINING_RESULT_DIR, description: "directory for placing training-result" },
    Opt { flag: "input", env: "INPUT", default: "", description: "input data" },
    Opt { flag: "output", env: "OUTPUT", default: "", description: "destination information of output" },
];

fn with_common_flags(mut cmd: Command) -> Command {
    for opt in STRING_OPTS {
        cmd = cmd.flag(Flag::new(opt.flag, FlagType::String).description(opt.description));
    }
    cmd = cmd.flag(Flag::new("port", FlagType::Int).description("listen port of service"));
    cmd = cmd.flag(Flag::new("healthcheck_port", FlagType::Int).description("listen port of health check"));
    cmd = cmd.flag(
        Flag::new("training_job_definition_version", FlagType::Int).description("version of training job definition"),
    );
    cmd
}

fn string_opt(c: &Context, opt: &Opt) -> String {
    c.string_flag(opt.flag)
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| env::var(opt.env).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| opt.default.to_owned())
}

fn int_opt(c: &Context, flag: &str, env_key: &str, default: i64) -> anyhow::Result<i64> {
    if let Ok(value) = c.int_flag(flag) {
        return i64::try_from(value).with_context(|| format!("flag {flag} is out of range"));
    }
    match env::var(env_key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<i64>()
            .with_context(|| format!("environment variable {env_key} must be an integer, got [{raw}]")),
        _ => Ok(default),
    }
}

fn port_opt(c: &Context, flag: &str, env_key: &str, default: u16) -> anyhow::Result<u16> {
    let raw = int_opt(c, flag, env_key, i64::from(default))?;
    u16::try_from(raw).map_err(|_| anyhow::anyhow!("port [{raw}] must be greater than 1023 and less than 65536"))
}

fn build_conf(c: &Context) -> anyhow::Result<Conf> {
    let mut conf = Conf::default();
    for opt in STRING_OPTS {
        let value = string_opt(c, opt);
        match opt.flag {
            "abeja_api_url" => conf.api_url = value,
            "abeja_organization_id" => conf.organization_id = value,
            "abeja_model_id" => conf.model_id = value,
            "abeja_model_version" => conf.model_version = value,
            "abeja_model_version_id" => conf.model_version_id = value,
            "abeja_deployment_id" => conf.deployment_id = value,
            "abeja_service_id" => conf.service_id = value,
            "abeja_deployment_code_download" => conf.deployment_code_download = value,
            "abeja_training_model_download" => conf.training_model_download = value,
            "abeja_user_model_root" => conf.user_model_root = value,
            "platform_auth_token" => conf.platform_auth_token = value,
            "abeja_platform_user_id" => conf.platform_user_id = value,
            "abeja_platform_personal_access_token" => conf.platform_personal_access_token = value,
            "training_job_id" => conf.training_job_id = value,
            "training_job_ids" => conf.training_job_ids = value,
            "training_job_definition_name" => conf.training_job_definition_name = value,
            "tensorboard_id" => conf.tensorboard_id = value,
            "mount_target_dir" => conf.mount_target_dir = value,
            "abeja_run_id" => conf.run_id = value,
            "abeja_runtime" => conf.runtime = value,
            "abeja_training_result_dir" => conf.training_result_dir = value,
            "input" => conf.input = value,
            "output" => conf.output = value,
            other => anyhow::bail!("unhandled option: {other}"),
        }
    }
    conf.port = port_opt(c, "port", "PORT", config::DEFAULT_HTTP_LISTEN_PORT)?;
    conf.health_check_port = port_opt(
        c,
        "healthcheck_port",
        "HEALTHCHECK_PORT",
        config::DEFAULT_HEALTH_CHECK_LISTEN_PORT,
    )?;
    conf.training_job_definition_version =
        int_opt(c, "training_job_definition_version", "TRAINING_JOB_DEFINITION_VERSION", 0)?;
    Ok(conf)
}

fn validate_service(conf: &Conf) -> anyhow::Result<()> {
    let mut missing = Vec::new();
    if conf.organization_id.is_empty() {
        missing.push("abeja_organization_id");
    }
    if conf.model_id.is_empty() {
        missing.push("abeja_model_id");
    }
    if conf.model_version_id.is_empty() {
        missing.push("abeja_model_version_id");
    }
    if conf.platform_auth_token.is_empty() {
        missing.push("platform_auth_token");
    }
    if !missing.is_empty() {
        anyhow::bail!("require flag(s) {} not set", missing.join(", "));
    }
    validate_port_number(conf.port)?;
    validate_port_number(conf.health_check_port)?;
    if !conf.service_id.is_empty() && conf.deployment_id.is_empty() {
        anyhow::bail!("flag abeja_deployment_id needs when you set abeja_service_id");
    }
    if conf.port == conf.health_check_port {
        anyhow::bail!("port and healthcheck_port should be different value");
    }
    Ok(())
}

fn validate_train(conf: &Conf) -> anyhow::Result<()> {
    let mut missing = Vec::new();
    if conf.organization_id.is_empty() {
        missing.push("abeja_organization_id");
    }
    if conf.training_job_definition_name.is_empty() {
        missing.push("training_job_definition_name");
    }
    if !missing.is_empty() {
        anyhow::bail!("require flag(s) {} not set", missing.join(", "));
    }
    validate_training_job_definition_version(conf.training_job_definition_version)?;
    validate_auth_parts(conf)
}

/// `train train` runs already-downloaded code; the definition version is
/// not needed.
fn validate_train_run(conf: &Conf) -> anyhow::Result<()> {
    validate_auth_parts(conf)
}

fn validate_batch(conf: &Conf) -> anyhow::Result<()> {
    if conf.organization_id.is_empty() {
        anyhow::bail!("require flag(s) abeja_organization_id not set");
    }
    validate_serving_code(conf)?;
    validate_trained_model(conf)?;
    validate_auth_parts(conf)
}

fn validate_tensorboard(conf: &Conf) -> anyhow::Result<()> {
    let mut missing = Vec::new();
    if conf.organization_id.is_empty() {
        missing.push("abeja_organization_id");
    }
    if conf.training_job_definition_name.is_empty() {
        missing.push("training_job_definition_name");
    }
    if conf.training_job_ids.is_empty() {
        missing.push("training_job_ids");
    }
    if conf.tensorboard_id.is_empty() {
        missing.push("tensorboard_id");
    }
    if !missing.is_empty() {
        anyhow::bail!("require flag(s) {} not set", missing.join(", "));
    }
    validate_auth_parts(conf)
}
