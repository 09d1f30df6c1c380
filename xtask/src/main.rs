use anyhow::{Context, Result};
use aws_config::SdkConfig;
use aws_sdk_cloudformation::error::DisplayErrorContext;
use aws_sdk_cloudformation::types::{Capability, Parameter};
use clap::{Parser, Subcommand};
use colored::*;
use infra::compute::{CODE_BUCKET_PARAMETER, CODE_KEY_PARAMETER};
use infra::{audit, Stack, StackConfig, StackOutputs};
use scripty::*;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

mod verify;

/// Build output of `cargo lambda build --output-format zip`
const ARTIFACT_PATH: &str = "target/lambda/bootstrap/bootstrap.zip";
const STACK_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Task lists project automation tool
#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "A task runner for the task lists stack")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the CloudFormation template
    Synth {
        /// AWS region to deploy to
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
        /// Environment name (dev, staging, prod)
        #[arg(short, long, default_value = "dev")]
        env: String,
        /// Output file, stdout when omitted
        #[arg(short, long)]
        out: Option<String>,
    },
    /// Run the policy audit on the synthesized stack
    Check {
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
        #[arg(short, long, default_value = "dev")]
        env: String,
    },
    /// Build the function, upload it and create or update the stack
    Deploy {
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
        #[arg(short, long, default_value = "dev")]
        env: String,
        /// S3 bucket receiving the function artifact
        #[arg(short, long)]
        bucket: String,
        /// Reuse the existing build artifact
        #[arg(long)]
        skip_build: bool,
    },
    /// Fetch stack outputs and write .env.{env}
    Outputs {
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
        #[arg(short, long, default_value = "dev")]
        env: String,
    },
    /// Check live resources of a deployed stack
    Verify {
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
        #[arg(short, long, default_value = "dev")]
        env: String,
    },
    /// Run tests
    Test {
        /// Run only the end-to-end tests of the function
        #[arg(short, long)]
        integration: bool,
        /// Run specific test pattern
        #[arg(short, long)]
        pattern: Option<String>,
    },
    /// Clean build artifacts and temporary files
    Clean {
        /// Also delete the CloudFormation stack (dangerous!)
        #[arg(long)]
        stack: bool,
        /// Environment to clean
        #[arg(short, long, default_value = "dev")]
        env: String,
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .init();

    let args = Args::parse();

    // Ensure we're in the project root
    if !Path::new("Cargo.toml").exists() {
        anyhow::bail!("Must be run from the project root directory");
    }

    match args.command {
        Command::Synth { region, env, out } => {
            println!("{}", "🏗️  Synthesizing stack template...".green().bold());
            synth_command(&region, &env, out.as_deref())?;
        }
        Command::Check { region, env } => {
            println!("{}", "🛡️  Auditing stack...".yellow().bold());
            check_command(&region, &env)?;
        }
        Command::Deploy {
            region,
            env,
            bucket,
            skip_build,
        } => {
            println!("{}", "📦 Deploying stack...".blue().bold());
            deploy_command(&region, &env, &bucket, skip_build).await?;
        }
        Command::Outputs { region, env } => {
            println!("{}", "📄 Fetching stack outputs...".blue().bold());
            outputs_command(&region, &env).await?;
        }
        Command::Verify { region, env } => {
            println!("{}", "🔎 Verifying deployment...".yellow().bold());
            verify_command(&region, &env).await?;
        }
        Command::Test {
            integration,
            pattern,
        } => {
            println!("{}", "🧪 Running tests...".yellow().bold());
            test_command(integration, pattern.as_deref())?;
        }
        Command::Clean { stack, env, region } => {
            println!("{}", "🧹 Cleaning up...".red().bold());
            clean_command(stack, &env, &region).await?;
        }
    }

    println!("{}", "✅ Task completed successfully!".green().bold());
    Ok(())
}

fn load_stack(region: &str, env: &str) -> Result<Stack> {
    let config = StackConfig::from_env(Some(env), Some(region))
        .context("Failed to load stack configuration")?;
    Stack::new(&config).context("Failed to build stack")
}

async fn aws_config_for(region: &str) -> SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await
}

fn synth_command(region: &str, env: &str, out: Option<&str>) -> Result<()> {
    let stack = load_stack(region, env)?;
    let template = stack
        .synthesize()
        .context("Failed to synthesize template")?
        .to_json_pretty()
        .context("Failed to render template")?;

    match out {
        Some(path) => {
            std::fs::write(path, &template).with_context(|| format!("Failed to write {path}"))?;
            println!("✅ Wrote {} template to {path}", stack.name());
        }
        None => println!("{template}"),
    }
    Ok(())
}

fn check_command(region: &str, env: &str) -> Result<()> {
    let stack = load_stack(region, env)?;
    run_audit(&stack)
}

fn run_audit(stack: &Stack) -> Result<()> {
    let report = audit(stack);

    for finding in report.warnings() {
        println!("{}", format!("⚠️  {finding}").yellow());
    }
    for finding in report.errors() {
        println!("{}", format!("❌ {finding}").red());
    }

    if report.is_clean() {
        println!("✅ Audit passed for {}", stack.name());
        Ok(())
    } else {
        let failures = report.errors().count();
        anyhow::bail!("Audit failed with {failures} error(s)")
    }
}

async fn check_aws_credentials(config: &SdkConfig) -> Result<()> {
    let sts_client = aws_sdk_sts::Client::new(config);

    match sts_client.get_caller_identity().send().await {
        Ok(identity) => {
            if let Some(arn) = identity.arn() {
                println!("✅ AWS credentials valid: {arn}");
            }
            Ok(())
        }
        Err(e) => {
            anyhow::bail!("❌ AWS credentials not configured or invalid: {}", e);
        }
    }
}

fn build_function() -> Result<()> {
    // Check if cargo-lambda is installed
    if cmd!("cargo", "lambda", "--version").run().is_err() {
        println!("{}", "❌ cargo-lambda not found. Installing...".yellow());
        cmd!("cargo", "install", "cargo-lambda")
            .run()
            .context("Failed to install cargo-lambda")?;
    }

    cmd!(
        "cargo",
        "lambda",
        "build",
        "--release",
        "--arm64",
        "--output-format",
        "zip",
        "--bin",
        "bootstrap"
    )
    .run()
    .context("Failed to build the function")?;
    Ok(())
}

fn upload_artifact(bucket: &str, key: &str, region: &str) -> Result<()> {
    if !Path::new(ARTIFACT_PATH).exists() {
        anyhow::bail!("{ARTIFACT_PATH} not found, build the function first");
    }
    let destination = format!("s3://{bucket}/{key}");
    cmd!("aws", "s3", "cp", ARTIFACT_PATH, &destination, "--region", region)
        .run()
        .with_context(|| format!("Failed to upload {ARTIFACT_PATH} to {destination}"))?;
    Ok(())
}

async fn deploy_command(region: &str, env: &str, bucket: &str, skip_build: bool) -> Result<()> {
    let stack = load_stack(region, env)?;

    println!("🛡️  Auditing {}...", stack.name());
    run_audit(&stack)?;

    let template = stack
        .synthesize()
        .context("Failed to synthesize template")?
        .to_json_pretty()
        .context("Failed to render template")?;

    let config = aws_config_for(region).await;
    println!("📋 Checking AWS credentials...");
    check_aws_credentials(&config).await?;

    if skip_build {
        println!("⏭️  Skipping build");
    } else {
        println!("🔨 Building function...");
        build_function()?;
    }

    let key = format!("{}/bootstrap-{}.zip", stack.name(), Uuid::new_v4());
    println!("☁️  Uploading artifact to s3://{bucket}/{key}...");
    upload_artifact(bucket, &key, region)?;

    let client = aws_sdk_cloudformation::Client::new(&config);
    let parameters = vec![
        Parameter::builder()
            .parameter_key(CODE_BUCKET_PARAMETER)
            .parameter_value(bucket)
            .build(),
        Parameter::builder()
            .parameter_key(CODE_KEY_PARAMETER)
            .parameter_value(&key)
            .build(),
    ];

    let stack_name = stack.name();
    if stack_exists(&client, &stack_name).await? {
        println!("🔄 Updating stack {stack_name}...");
        let result = client
            .update_stack()
            .stack_name(&stack_name)
            .template_body(&template)
            .set_parameters(Some(parameters))
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await;
        if let Err(e) = result {
            let message = DisplayErrorContext(&e).to_string();
            if message.contains("No updates are to be performed") {
                println!("✅ Stack {stack_name} is already up to date");
            } else {
                anyhow::bail!("Failed to update stack {stack_name}: {message}");
            }
        }
    } else {
        println!("🆕 Creating stack {stack_name}...");
        client
            .create_stack()
            .stack_name(&stack_name)
            .template_body(&template)
            .set_parameters(Some(parameters))
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create stack {stack_name}: {}",
                    DisplayErrorContext(&e)
                )
            })?;
    }

    wait_for_stack(&client, &stack_name).await?;

    let outputs = fetch_outputs(&client, &stack_name).await?;
    print_outputs(&outputs);
    write_env_file(&outputs, env, region)?;

    println!("Next steps:");
    println!(
        "1. Run 'cargo xtask verify --env {env} --region {region}' to check the deployed resources"
    );
    println!("2. Point the front-end at .env.{env}");
    Ok(())
}

async fn stack_exists(client: &aws_sdk_cloudformation::Client, stack_name: &str) -> Result<bool> {
    match client.describe_stacks().stack_name(stack_name).send().await {
        Ok(output) => Ok(output.stacks().iter().any(|s| {
            s.stack_status()
                .is_some_and(|status| status.as_str() != "DELETE_COMPLETE")
        })),
        Err(e) => {
            let message = DisplayErrorContext(&e).to_string();
            if message.contains("does not exist") {
                Ok(false)
            } else {
                anyhow::bail!("Failed to describe stack {stack_name}: {message}")
            }
        }
    }
}

async fn wait_for_stack(client: &aws_sdk_cloudformation::Client, stack_name: &str) -> Result<()> {
    loop {
        let output = client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to describe stack {stack_name}: {}",
                    DisplayErrorContext(&e)
                )
            })?;

        let status = output
            .stacks()
            .first()
            .and_then(|s| s.stack_status())
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();

        if status.ends_with("_IN_PROGRESS") {
            println!("⏳ {stack_name}: {status}");
            tokio::time::sleep(STACK_POLL_INTERVAL).await;
            continue;
        }
        if status.ends_with("_COMPLETE") && !status.contains("ROLLBACK") {
            println!("✅ {stack_name}: {status}");
            return Ok(());
        }
        anyhow::bail!("❌ Stack {stack_name} ended in {status}");
    }
}

async fn fetch_outputs(
    client: &aws_sdk_cloudformation::Client,
    stack_name: &str,
) -> Result<StackOutputs> {
    let output = client
        .describe_stacks()
        .stack_name(stack_name)
        .send()
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to describe stack {stack_name}: {}",
                DisplayErrorContext(&e)
            )
        })?;

    let stack = output
        .stacks()
        .first()
        .with_context(|| format!("Stack {stack_name} not found"))?;

    let pairs = stack
        .outputs()
        .iter()
        .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())));

    StackOutputs::from_pairs(pairs).context("Stack outputs are incomplete")
}

fn print_outputs(outputs: &StackOutputs) {
    println!("{}", "Stack outputs:".bold());
    println!("  API URL:             {}", outputs.api_url);
    println!("  User pool:           {}", outputs.user_pool_id);
    println!("  User pool client:    {}", outputs.user_pool_client_id);
    println!("  Identity pool:       {}", outputs.identity_pool_id);
    println!("  Function:            {}", outputs.function_arn);
    println!("  Execution role:      {}", outputs.execution_role_arn);
    if let Some(table) = &outputs.table_name {
        println!("  Table:               {table}");
    }
}

fn write_env_file(outputs: &StackOutputs, env: &str, region: &str) -> Result<()> {
    let config_file = format!(".env.{env}");
    std::fs::write(&config_file, outputs.to_env_file(env, region))
        .with_context(|| format!("Failed to write {config_file}"))?;

    println!("✅ Generated configuration: {config_file}");
    Ok(())
}

async fn deployed_outputs(region: &str, env: &str) -> Result<(SdkConfig, StackOutputs)> {
    let stack_config = StackConfig::from_env(Some(env), Some(region))
        .context("Failed to load stack configuration")?;
    let config = aws_config_for(region).await;
    let client = aws_sdk_cloudformation::Client::new(&config);
    let outputs = fetch_outputs(&client, &stack_config.stack_name()).await?;
    Ok((config, outputs))
}

async fn outputs_command(region: &str, env: &str) -> Result<()> {
    let (_, outputs) = deployed_outputs(region, env).await?;
    print_outputs(&outputs);
    write_env_file(&outputs, env, region)
}

async fn verify_command(region: &str, env: &str) -> Result<()> {
    let (config, outputs) = deployed_outputs(region, env).await?;
    let verification = verify::verify_deployment(&config, &outputs).await?;

    if verification.is_ok() {
        println!("✅ Deployed resources match the stack model");
        return Ok(());
    }
    for problem in &verification.problems {
        println!("{}", format!("❌ {problem}").red());
    }
    anyhow::bail!("Verification found {} problem(s)", verification.problems.len())
}

fn test_command(integration: bool, pattern: Option<&str>) -> Result<()> {
    let mut test_cmd = if integration {
        println!("🔄 Running end-to-end tests...");
        cmd!("cargo", "test", "-p", "lambda", "integration_tests")
    } else {
        println!("🧪 Running unit tests...");
        cmd!("cargo", "test", "--workspace")
    };

    if let Some(p) = pattern {
        test_cmd = test_cmd.arg("--").arg(p);
    }
    test_cmd.run().context("Tests failed")?;

    Ok(())
}

async fn clean_command(stack: bool, env: &str, region: &str) -> Result<()> {
    println!("🧹 Cleaning build artifacts...");
    cmd!("cargo", "clean")
        .run()
        .context("Failed to clean cargo artifacts")?;

    // Clean temporary files
    for temp_file in &[".env.tmp", "template.json"] {
        if Path::new(temp_file).exists() {
            std::fs::remove_file(temp_file)
                .with_context(|| format!("Failed to remove {temp_file}"))?;
        }
    }

    if stack {
        let stack_config = StackConfig::from_env(Some(env), Some(region))
            .context("Failed to load stack configuration")?;
        let stack_name = stack_config.stack_name();

        println!(
            "{}",
            "⚠️  Deleting the stack (this will delete data!)"
                .red()
                .bold()
        );
        println!("This deletes the table, the user directory and every user in it.");
        println!("Type the stack name '{stack_name}' to continue:");

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() == stack_name {
            let config = aws_config_for(region).await;
            let client = aws_sdk_cloudformation::Client::new(&config);
            client
                .delete_stack()
                .stack_name(&stack_name)
                .send()
                .await
                .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to delete stack {stack_name}: {}",
                    DisplayErrorContext(&e)
                )
            })?;
            println!("🗑️  Deletion of {stack_name} started");
        } else {
            println!("Skipping stack deletion.");
        }
    }

    Ok(())
}
