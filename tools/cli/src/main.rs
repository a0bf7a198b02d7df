//! MediaGuard CLI - operator interface to the key-management core.
//!
//! This tool mints and rotates per-resource keys, manages sharing and
//! policies, and runs the gated open path: evaluate, retrieve, decrypt.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mediaguard_common::{Error, PolicyId, ResourceId, Role, UserId};
use mediaguard_crypto::shamir::{self, Share};
use mediaguard_crypto::{DataKey, DecryptingStream, EncryptingStream, KdfParams, RootKey};
use mediaguard_kms::{KeyStatus, KeyStore, KmsConfig, RootKeySource, SplitParams, ROOT_KEY_ENV};
use mediaguard_policy::{
    create_default_registry, AccessRequest, Decision, EngineConfig, Policy, PolicyEngine,
    PolicyKind, PolicyManager, PolicySpec,
};
use mediaguard_storage::SqliteStore;

#[derive(Parser)]
#[command(name = "mediaguard")]
#[command(about = "MediaGuard - per-resource key management and access policy")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file.
    #[arg(short, long, global = true, default_value = "mediaguard.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a root key and write a configuration file.
    GenRootKey {
        /// Derive the root key from the passphrase in this environment variable instead.
        #[arg(long)]
        passphrase_env: Option<String>,

        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(short, long, default_value = "moderate")]
        strength: String,

        /// Database path to record in the configuration.
        #[arg(long, default_value = "mediaguard.db")]
        database: PathBuf,
    },

    /// Mint a key for a resource and encrypt its payload.
    Encrypt {
        #[arg(short, long)]
        resource: u64,

        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Split the key into this many shares.
        #[arg(long, requires = "threshold")]
        shares: Option<usize>,

        /// Shares needed to reconstruct.
        #[arg(long, requires = "shares")]
        threshold: Option<usize>,

        /// Use chunked encryption for large payloads.
        #[arg(long)]
        chunked: bool,
    },

    /// Decrypt a payload with the resource's key, bypassing policy.
    Decrypt {
        #[arg(short, long)]
        resource: u64,

        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Share files, for split keys.
        #[arg(long = "share")]
        share_files: Vec<PathBuf>,

        #[arg(long)]
        chunked: bool,
    },

    /// Split a secret file into share files.
    Split {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short = 'n', long)]
        shares: usize,

        #[arg(short = 'k', long)]
        threshold: usize,

        /// Directory for share-<index>.txt files.
        #[arg(short, long)]
        out_dir: PathBuf,
    },

    /// Reconstruct a secret from share files.
    Combine {
        #[arg(short = 'k', long)]
        threshold: usize,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(required = true)]
        share_files: Vec<PathBuf>,
    },

    /// Store an existing key (base64 file) for a resource.
    Store {
        #[arg(short, long)]
        resource: u64,

        #[arg(short, long)]
        key_file: PathBuf,

        #[arg(long, requires = "threshold")]
        shares: Option<usize>,

        #[arg(long, requires = "shares")]
        threshold: Option<usize>,
    },

    /// Print the resource's key (base64), bypassing policy.
    Retrieve {
        #[arg(short, long)]
        resource: u64,

        #[arg(long = "share")]
        share_files: Vec<PathBuf>,
    },

    /// Revoke the resource's key. Irreversible.
    Revoke {
        #[arg(short, long)]
        resource: u64,
    },

    /// Rotate the resource's key and re-encrypt its payload in place.
    Rotate {
        #[arg(short, long)]
        resource: u64,

        /// Encrypted payload to re-encrypt.
        #[arg(short, long)]
        payload: PathBuf,

        #[arg(long)]
        chunked: bool,
    },

    /// Show key metadata for one resource, or all keys.
    KeyInfo {
        #[arg(short, long)]
        resource: Option<u64>,

        /// Filter by status when listing: "active" or "revoked".
        #[arg(long)]
        status: Option<String>,
    },

    /// Write one share of the resource's key to a file for its holder.
    IssueShare {
        #[arg(short, long)]
        resource: u64,

        #[arg(long)]
        index: u8,

        /// Record this user as the share's holder.
        #[arg(long)]
        holder: Option<u64>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Share a resource with users.
    Share {
        #[arg(short, long)]
        resource: u64,

        #[arg(short, long, value_delimiter = ',', required = true)]
        users: Vec<u64>,

        /// User granting the share.
        #[arg(long)]
        by: u64,

        /// Grant only until this RFC 3339 instant.
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Stop sharing a resource with a user.
    Unshare {
        #[arg(short, long)]
        resource: u64,

        #[arg(short, long)]
        user: u64,
    },

    /// Attach a policy given as JSON, e.g. '{"kind":"multi_party","threshold":2}'.
    PolicyAdd {
        #[arg(short, long)]
        resource: u64,

        #[arg(short, long)]
        spec: String,

        #[arg(short, long, default_value_t = 0)]
        priority: i32,

        #[arg(long)]
        by: Option<u64>,
    },

    /// List the policies of a resource.
    PolicyList {
        #[arg(short, long)]
        resource: u64,
    },

    /// Enable, disable or delete a policy.
    PolicySet {
        #[arg(long)]
        id: String,

        #[arg(long, conflicts_with = "delete")]
        enabled: Option<bool>,

        #[arg(long)]
        delete: bool,
    },

    /// Evaluate an access request and print the decision.
    Check {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Evaluate, and on allow retrieve the key and decrypt the payload.
    Open {
        #[command(flatten)]
        request: RequestArgs,

        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long = "share")]
        share_files: Vec<PathBuf>,

        #[arg(long)]
        chunked: bool,
    },

    /// Print the access audit log.
    Audit {
        #[arg(short, long)]
        resource: Option<u64>,
    },
}

#[derive(clap::Args)]
struct RequestArgs {
    #[arg(short, long)]
    resource: u64,

    /// Requesting user.
    #[arg(short, long)]
    user: u64,

    /// "user" or "admin".
    #[arg(long, default_value = "user")]
    role: String,

    /// Owner of the resource.
    #[arg(long)]
    owner: u64,

    /// Users who approved this request.
    #[arg(long, value_delimiter = ',')]
    approvals: Vec<u64>,
}

impl RequestArgs {
    fn to_request(&self) -> Result<AccessRequest> {
        let role: Role = self.role.parse()?;
        Ok(AccessRequest::new(
            ResourceId(self.resource),
            UserId(self.user),
            role,
            UserId(self.owner),
        )
        .with_approvals(self.approvals.iter().copied().map(UserId)))
    }
}

/// On-disk configuration: key management plus policy engine settings.
#[derive(Serialize, Deserialize)]
struct CliConfig {
    #[serde(flatten)]
    kms: KmsConfig,
    #[serde(default)]
    policy: EngineConfig,
}

/// Everything a command needs, opened from the configuration.
struct Platform {
    store: Arc<SqliteStore>,
    default_split: Option<SplitParams>,
    keys: KeyStore,
    policies: PolicyManager,
    engine: PolicyEngine,
}

impl Platform {
    fn open(config_path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        let config: CliConfig = serde_json::from_str(&text).context("Invalid configuration")?;
        let kms = KmsConfig::from_env_or(config.kms);
        kms.validate()?;

        let root = kms.resolve_root_key().context("Failed to resolve root key")?;
        let store = Arc::new(
            SqliteStore::open(&kms.database_path, Arc::new(create_default_registry()))
                .context("Failed to open database")?,
        );
        info!(root = %root.fingerprint(), db = %kms.database_path.display(), "Platform opened");

        Ok(Self {
            keys: KeyStore::new(&root, store.clone()),
            policies: PolicyManager::new(store.clone()),
            engine: PolicyEngine::with_config(config.policy, store.clone()),
            default_split: kms.default_split,
            store,
        })
    }

    /// The split asked for on the command line, else the configured default.
    fn split_or_default(&self, requested: Option<SplitParams>) -> Option<SplitParams> {
        requested.or(self.default_split)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.config.as_path();
    match cli.command {
        Commands::GenRootKey {
            passphrase_env,
            strength,
            database,
        } => cmd_gen_root_key(config, passphrase_env, &strength, database),

        Commands::Encrypt {
            resource,
            input,
            output,
            shares,
            threshold,
            chunked,
        } => cmd_encrypt(config, resource, &input, &output, split(shares, threshold), chunked),

        Commands::Decrypt {
            resource,
            input,
            output,
            share_files,
            chunked,
        } => cmd_decrypt(config, resource, &input, &output, &share_files, chunked),

        Commands::Split {
            input,
            shares,
            threshold,
            out_dir,
        } => cmd_split(&input, shares, threshold, &out_dir),

        Commands::Combine {
            threshold,
            output,
            share_files,
        } => cmd_combine(threshold, &output, &share_files),

        Commands::Store {
            resource,
            key_file,
            shares,
            threshold,
        } => cmd_store(config, resource, &key_file, split(shares, threshold)),

        Commands::Retrieve {
            resource,
            share_files,
        } => cmd_retrieve(config, resource, &share_files),

        Commands::Revoke { resource } => cmd_revoke(config, resource),

        Commands::Rotate {
            resource,
            payload,
            chunked,
        } => cmd_rotate(config, resource, &payload, chunked),

        Commands::KeyInfo { resource, status } => cmd_key_info(config, resource, status),

        Commands::IssueShare {
            resource,
            index,
            holder,
            output,
        } => cmd_issue_share(config, resource, index, holder, &output),

        Commands::Share {
            resource,
            users,
            by,
            until,
        } => cmd_share(config, resource, &users, by, until),

        Commands::Unshare { resource, user } => cmd_unshare(config, resource, user),

        Commands::PolicyAdd {
            resource,
            spec,
            priority,
            by,
        } => cmd_policy_add(config, resource, &spec, priority, by),

        Commands::PolicyList { resource } => cmd_policy_list(config, resource),

        Commands::PolicySet { id, enabled, delete } => cmd_policy_set(config, &id, enabled, delete),

        Commands::Check { request } => cmd_check(config, &request),

        Commands::Open {
            request,
            input,
            output,
            share_files,
            chunked,
        } => cmd_open(config, &request, &input, &output, &share_files, chunked),

        Commands::Audit { resource } => cmd_audit(config, resource),
    }
}

fn split(shares: Option<usize>, threshold: Option<usize>) -> Option<SplitParams> {
    match (shares, threshold) {
        (Some(n), Some(k)) => Some(SplitParams::new(n, k)),
        _ => None,
    }
}

fn write_share(path: &Path, share: &Share) -> Result<()> {
    std::fs::write(path, STANDARD.encode(share.to_bytes().as_bytes()))
        .with_context(|| format!("Failed to write share {}", path.display()))
}

fn read_shares(paths: &[PathBuf]) -> Result<Vec<Share>> {
    paths
        .iter()
        .map(|path| {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read share {}", path.display()))?;
            let bytes = STANDARD
                .decode(text.trim())
                .with_context(|| format!("Share {} is not base64", path.display()))?;
            Ok(Share::from_bytes(&bytes)?)
        })
        .collect()
}

fn encrypt_file(key: &DataKey, input: &Path, output: &Path, chunked: bool) -> Result<()> {
    if chunked {
        let reader = BufReader::new(File::open(input).context("Failed to open input")?);
        let mut writer = BufWriter::new(File::create(output).context("Failed to create output")?);
        EncryptingStream::new(key).encrypt_stream(reader, &mut writer)?;
        writer.flush()?;
    } else {
        let plaintext = std::fs::read(input).context("Failed to read input")?;
        std::fs::write(output, mediaguard_crypto::encrypt(&plaintext, key)?)
            .context("Failed to write output")?;
    }
    Ok(())
}

fn decrypt_file(key: &DataKey, input: &Path, output: &Path, chunked: bool) -> Result<()> {
    if chunked {
        let reader = BufReader::new(File::open(input).context("Failed to open input")?);
        let mut writer = BufWriter::new(File::create(output).context("Failed to create output")?);
        DecryptingStream::new(key).decrypt_stream(reader, &mut writer)?;
        writer.flush()?;
    } else {
        let blob = std::fs::read(input).context("Failed to read input")?;
        std::fs::write(output, mediaguard_crypto::decrypt(&blob, key)?)
            .context("Failed to write output")?;
    }
    Ok(())
}

fn require_key(key: Option<DataKey>, resource: u64) -> Result<DataKey> {
    match key {
        Some(key) => Ok(key),
        None => bail!("Resource {} has no active key", resource),
    }
}

/// Generate a root key and write the configuration.
fn cmd_gen_root_key(
    config_path: &Path,
    passphrase_env: Option<String>,
    strength: &str,
    database: PathBuf,
) -> Result<()> {
    if config_path.exists() {
        bail!("Configuration {} already exists", config_path.display());
    }

    let kdf = match strength {
        "interactive" => KdfParams::interactive(),
        "moderate" => KdfParams::moderate(),
        "sensitive" => KdfParams::sensitive(),
        _ => {
            bail!("Invalid strength. Use: interactive, moderate, or sensitive");
        }
    };

    let (source, root) = match passphrase_env {
        Some(var) => {
            let source = RootKeySource::new_passphrase(var, kdf);
            let root = source.resolve().context("Failed to derive root key")?;
            (source, root)
        }
        None => {
            let root = RootKey::generate();
            println!("Root key (store it in {}):", ROOT_KEY_ENV);
            println!("  {}", root.to_base64());
            (
                RootKeySource::Env {
                    var: ROOT_KEY_ENV.to_string(),
                },
                root,
            )
        }
    };

    let mut kms = KmsConfig::new(source);
    kms.root_fingerprint = Some(root.fingerprint());
    kms.database_path = database;
    let config = CliConfig {
        kms,
        policy: EngineConfig::default(),
    };
    std::fs::write(config_path, serde_json::to_string_pretty(&config)?)
        .context("Failed to write configuration")?;

    println!("Configuration written: {}", config_path.display());
    println!("  Root fingerprint: {}", root.fingerprint());
    Ok(())
}

/// Mint a key for a resource and encrypt its payload.
fn cmd_encrypt(
    config: &Path,
    resource: u64,
    input: &Path,
    output: &Path,
    split: Option<SplitParams>,
    chunked: bool,
) -> Result<()> {
    let platform = Platform::open(config)?;
    let split = platform.split_or_default(split);
    let staged = output.with_extension("sealing");

    // Seal first: the key is stored only once the ciphertext exists, so an
    // I/O failure leaves the resource free for another attempt.
    let key = DataKey::generate();
    if let Err(e) = encrypt_file(&key, input, &staged, chunked) {
        let _ = std::fs::remove_file(&staged);
        return Err(e.context("Encryption failed; no key stored"));
    }
    let record = match platform.keys.store_key(ResourceId(resource), &key, split) {
        Ok(record) => record,
        Err(e) => {
            let _ = std::fs::remove_file(&staged);
            return Err(anyhow::Error::new(e).context("Failed to store key"));
        }
    };
    std::fs::rename(&staged, output).with_context(|| {
        format!(
            "Key stored but the ciphertext is still at {}",
            staged.display()
        )
    })?;

    println!("Encrypted resource {} -> {}", resource, output.display());
    if record.is_split() {
        println!(
            "  Key split into {} shares, {} required",
            record.total_shares, record.threshold
        );
    }
    Ok(())
}

/// Decrypt a payload with the resource's key.
fn cmd_decrypt(
    config: &Path,
    resource: u64,
    input: &Path,
    output: &Path,
    share_files: &[PathBuf],
    chunked: bool,
) -> Result<()> {
    let platform = Platform::open(config)?;
    let shares = read_shares(share_files)?;
    let key = require_key(
        platform.keys.retrieve_key(ResourceId(resource), &shares)?,
        resource,
    )?;

    decrypt_file(&key, input, output, chunked).context("Decryption failed")?;
    println!("Decrypted resource {} -> {}", resource, output.display());
    Ok(())
}

/// Split a secret file into share files.
fn cmd_split(input: &Path, n: usize, k: usize, out_dir: &Path) -> Result<()> {
    let secret = std::fs::read(input).context("Failed to read secret")?;
    let shares = shamir::split(&secret, n, k)?;

    std::fs::create_dir_all(out_dir).context("Failed to create output directory")?;
    for share in &shares {
        write_share(&out_dir.join(format!("share-{}.txt", share.index())), share)?;
    }

    println!("Wrote {} shares ({} required) to {}", n, k, out_dir.display());
    Ok(())
}

/// Reconstruct a secret from share files.
fn cmd_combine(k: usize, output: &Path, share_files: &[PathBuf]) -> Result<()> {
    let shares = read_shares(share_files)?;
    let secret = shamir::reconstruct(&shares, k)?;
    std::fs::write(output, secret.as_bytes()).context("Failed to write secret")?;

    println!("Reconstructed {} bytes -> {}", secret.len(), output.display());
    Ok(())
}

/// Store an existing key for a resource.
fn cmd_store(config: &Path, resource: u64, key_file: &Path, split: Option<SplitParams>) -> Result<()> {
    let text = std::fs::read_to_string(key_file).context("Failed to read key file")?;
    let bytes = STANDARD.decode(text.trim()).context("Key file is not base64")?;
    let key = DataKey::from_slice(&bytes)?;

    let platform = Platform::open(config)?;
    let split = platform.split_or_default(split);
    let record = platform.keys.store_key(ResourceId(resource), &key, split)?;

    println!("Stored key for resource {} (record {})", resource, record.id);
    Ok(())
}

/// Print the resource's key.
fn cmd_retrieve(config: &Path, resource: u64, share_files: &[PathBuf]) -> Result<()> {
    let platform = Platform::open(config)?;
    let shares = read_shares(share_files)?;

    match platform.keys.retrieve_key(ResourceId(resource), &shares)? {
        Some(key) => println!("{}", STANDARD.encode(key.as_bytes())),
        None => bail!("Resource {} has no active key", resource),
    }
    Ok(())
}

/// Revoke the resource's key.
fn cmd_revoke(config: &Path, resource: u64) -> Result<()> {
    let platform = Platform::open(config)?;
    if platform.keys.revoke_key(ResourceId(resource))? {
        println!("Key for resource {} revoked", resource);
    } else {
        println!("Resource {} has no active key", resource);
    }
    Ok(())
}

/// Rotate the resource's key and re-encrypt its payload.
fn cmd_rotate(config: &Path, resource: u64, payload: &Path, chunked: bool) -> Result<()> {
    let platform = Platform::open(config)?;
    let staged = payload.with_extension("rotating");

    let record = platform.keys.rotate_key(ResourceId(resource), |old, new| {
        let blob = std::fs::read(payload)?;
        let reencrypted = if chunked {
            let plaintext = mediaguard_crypto::stream::decrypt_bytes(old, &blob)?;
            mediaguard_crypto::stream::encrypt_bytes(new, &plaintext)?
        } else {
            let plaintext = mediaguard_crypto::decrypt(&blob, old)?;
            mediaguard_crypto::encrypt(&plaintext, new)?
        };
        std::fs::write(&staged, reencrypted)?;
        Ok(())
    });

    let record = match record {
        Ok(record) => record,
        Err(e) => {
            let _ = std::fs::remove_file(&staged);
            return Err(anyhow::Error::new(e).context("Rotation failed; old key kept"));
        }
    };
    replace_payload(&staged, payload)?;

    println!("Rotated key for resource {} (record {})", resource, record.id);
    Ok(())
}

/// Move a re-encrypted payload into place after its key was committed.
///
/// On failure the staged file is kept, since it is the only copy readable
/// under the new key.
fn replace_payload(staged: &Path, payload: &Path) -> Result<()> {
    std::fs::rename(staged, payload).with_context(|| {
        format!(
            "Key rotated but the payload could not be replaced; the re-encrypted payload is at {}",
            staged.display()
        )
    })
}

/// Show key metadata.
fn cmd_key_info(config: &Path, resource: Option<u64>, status: Option<String>) -> Result<()> {
    let platform = Platform::open(config)?;

    let infos: Vec<_> = match resource {
        Some(id) => platform.keys.key_info(ResourceId(id))?.into_iter().collect(),
        None => {
            let status = status.map(|s| s.parse::<KeyStatus>()).transpose()?;
            platform.keys.list_keys(status)?
        }
    };

    if infos.is_empty() {
        println!("No keys found.");
    }
    for info in infos {
        println!("{}", serde_json::to_string_pretty(&info)?);
    }
    Ok(())
}

/// Write one share to a file for its holder.
fn cmd_issue_share(
    config: &Path,
    resource: u64,
    index: u8,
    holder: Option<u64>,
    output: &Path,
) -> Result<()> {
    let platform = Platform::open(config)?;
    let share = platform.keys.issue_share(ResourceId(resource), index)?;
    write_share(output, &share)?;

    if let Some(holder) = holder {
        platform
            .keys
            .assign_holder(ResourceId(resource), index, UserId(holder))?;
    }
    println!("Share {} of resource {} -> {}", index, resource, output.display());
    Ok(())
}

/// Share a resource with users.
fn cmd_share(
    config: &Path,
    resource: u64,
    users: &[u64],
    by: u64,
    until: Option<DateTime<Utc>>,
) -> Result<()> {
    let platform = Platform::open(config)?;
    let users: Vec<UserId> = users.iter().copied().map(UserId).collect();

    let policy = match until {
        Some(at) => platform
            .policies
            .share_file_until(ResourceId(resource), &users, UserId(by), at)?,
        None => platform
            .policies
            .share_file(ResourceId(resource), &users, UserId(by))?,
    };
    println!("Resource {} shared (policy {})", resource, policy.id);
    Ok(())
}

/// Stop sharing a resource with a user.
fn cmd_unshare(config: &Path, resource: u64, user: u64) -> Result<()> {
    let platform = Platform::open(config)?;
    if platform
        .policies
        .revoke_share(ResourceId(resource), UserId(user))?
    {
        println!("User {} no longer has access to resource {}", user, resource);
    } else {
        println!("User {} was not shared on resource {}", user, resource);
    }
    Ok(())
}

/// Attach a policy.
fn cmd_policy_add(
    config: &Path,
    resource: u64,
    spec: &str,
    priority: i32,
    by: Option<u64>,
) -> Result<()> {
    let spec: PolicySpec = serde_json::from_str(spec).context("Invalid policy JSON")?;
    let registry = create_default_registry();
    let kind = PolicyKind::from_spec(spec, &registry)?;

    let platform = Platform::open(config)?;
    let mut policy = Policy::new(ResourceId(resource), kind).with_priority(priority);
    policy.created_by = by.map(UserId);
    let policy = platform.policies.create_policy(policy)?;

    println!("Policy {} attached to resource {}", policy.id, resource);
    Ok(())
}

/// List the policies of a resource.
fn cmd_policy_list(config: &Path, resource: u64) -> Result<()> {
    let platform = Platform::open(config)?;
    let policies = platform.policies.policies_for(ResourceId(resource))?;

    if policies.is_empty() {
        println!("No policies on resource {}.", resource);
    }
    for policy in policies {
        println!(
            "{} [{}] priority={} {}",
            policy.id,
            if policy.enabled { "on" } else { "off" },
            policy.priority,
            serde_json::to_string(&policy.kind.to_spec())?
        );
    }
    Ok(())
}

/// Enable, disable or delete a policy.
fn cmd_policy_set(config: &Path, id: &str, enabled: Option<bool>, delete: bool) -> Result<()> {
    let uuid = id.parse().context("Invalid policy id")?;
    let id = PolicyId::from_uuid(uuid);
    let platform = Platform::open(config)?;

    if delete {
        if !platform.policies.delete_policy(id)? {
            bail!("Policy {} not found", id);
        }
        println!("Policy {} deleted", id);
    } else if let Some(enabled) = enabled {
        platform.policies.set_enabled(id, enabled)?;
        println!("Policy {} {}", id, if enabled { "enabled" } else { "disabled" });
    } else {
        bail!("Nothing to do: pass --enabled or --delete");
    }
    Ok(())
}

/// Evaluate an access request.
fn cmd_check(config: &Path, args: &RequestArgs) -> Result<()> {
    let platform = Platform::open(config)?;
    let request = args.to_request()?;
    let policies = platform.policies.policies_for(request.resource_id)?;
    let evaluation = platform.engine.evaluate(&request, &policies, Utc::now())?;

    println!("{} ({})", evaluation.decision, evaluation.reason);
    Ok(())
}

/// Evaluate, retrieve and decrypt.
fn cmd_open(
    config: &Path,
    args: &RequestArgs,
    input: &Path,
    output: &Path,
    share_files: &[PathBuf],
    chunked: bool,
) -> Result<()> {
    let platform = Platform::open(config)?;
    let request = args.to_request()?;
    let policies = platform.policies.policies_for(request.resource_id)?;
    let evaluation = platform.engine.evaluate(&request, &policies, Utc::now())?;

    let refusal = match evaluation.decision {
        Decision::Allow => None,
        Decision::RequireShares(missing) => Some(format!("needs {} more approvals", missing)),
        Decision::Deny => Some(evaluation.reason),
    };
    if let Some(reason) = refusal {
        return Err(Error::NotAuthorized(reason).into());
    }

    let shares = read_shares(share_files)?;
    let key = require_key(
        platform.keys.retrieve_key(request.resource_id, &shares)?,
        args.resource,
    )?;
    decrypt_file(&key, input, output, chunked).context("Decryption failed")?;

    println!("Opened resource {} -> {}", args.resource, output.display());
    Ok(())
}

/// Print the audit log.
fn cmd_audit(config: &Path, resource: Option<u64>) -> Result<()> {
    let platform = Platform::open(config)?;
    let entries = platform.store.audit_entries(resource.map(ResourceId))?;

    for entry in entries {
        println!(
            "{} resource={} requester={} decision={} policy={} reason={}",
            entry.timestamp.to_rfc3339(),
            entry.resource_id,
            entry.requester_id,
            entry.decision,
            entry
                .policy_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry.reason
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_split_args() {
        assert_eq!(split(Some(5), Some(3)), Some(SplitParams::new(5, 3)));
        assert_eq!(split(None, None), None);
    }

    #[test]
    fn test_share_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let secret = b"0123456789abcdef0123456789abcdef";
        let input = dir.path().join("secret");
        std::fs::write(&input, secret).unwrap();

        cmd_split(&input, 5, 3, dir.path()).unwrap();
        let files: Vec<PathBuf> = [1, 3, 5]
            .iter()
            .map(|i| dir.path().join(format!("share-{}.txt", i)))
            .collect();

        let output = dir.path().join("restored");
        cmd_combine(3, &output, &files).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), secret);
    }

    #[test]
    fn test_request_args() {
        let args = RequestArgs {
            resource: 10,
            user: 5,
            role: "admin".to_string(),
            owner: 3,
            approvals: vec![7, 8],
        };
        let request = args.to_request().unwrap();
        assert_eq!(request.role, Role::Admin);
        assert_eq!(request.approvals.len(), 2);

        let bad = RequestArgs {
            role: "root".to_string(),
            ..args
        };
        assert!(bad.to_request().is_err());
    }

    fn write_config(dir: &Path, default_split: Option<SplitParams>) -> PathBuf {
        let config = dir.join("mediaguard.json");
        let mut kms = KmsConfig::new(RootKeySource::Raw {
            key_b64: RootKey::generate().to_base64(),
        });
        kms.database_path = dir.join("db");
        kms.default_split = default_split;
        std::fs::write(
            &config,
            serde_json::to_string(&CliConfig {
                kms,
                policy: EngineConfig::default(),
            })
            .unwrap(),
        )
        .unwrap();
        config
    }

    #[test]
    fn test_encrypt_applies_default_split() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), Some(SplitParams::new(3, 2)));
        let plain = dir.path().join("clip.raw");
        std::fs::write(&plain, b"frames").unwrap();

        cmd_encrypt(&config, 10, &plain, &dir.path().join("a.enc"), None, false).unwrap();
        cmd_encrypt(
            &config,
            11,
            &plain,
            &dir.path().join("b.enc"),
            Some(SplitParams::new(5, 3)),
            false,
        )
        .unwrap();

        let platform = Platform::open(&config).unwrap();
        let defaulted = platform.keys.key_info(ResourceId(10)).unwrap().unwrap();
        assert_eq!((defaulted.total_shares, defaulted.threshold), (3, 2));
        let explicit = platform.keys.key_info(ResourceId(11)).unwrap().unwrap();
        assert_eq!((explicit.total_shares, explicit.threshold), (5, 3));
    }

    #[test]
    fn test_failed_encrypt_keeps_resource_usable() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), None);
        let plain = dir.path().join("clip.raw");
        let sealed = dir.path().join("clip.enc");

        assert!(cmd_encrypt(&config, 10, &plain, &sealed, None, false).is_err());
        assert!(!sealed.exists());

        std::fs::write(&plain, b"frames").unwrap();
        cmd_encrypt(&config, 10, &plain, &sealed, None, false).unwrap();
        assert!(sealed.exists());
        assert!(!sealed.with_extension("sealing").exists());
    }

    #[test]
    fn test_open_refusal_is_not_authorized() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), None);
        let plain = dir.path().join("clip.raw");
        let sealed = dir.path().join("clip.enc");
        std::fs::write(&plain, b"frames").unwrap();
        cmd_encrypt(&config, 10, &plain, &sealed, None, false).unwrap();

        let stranger = RequestArgs {
            resource: 10,
            user: 6,
            role: "user".to_string(),
            owner: 3,
            approvals: vec![],
        };
        let err = cmd_open(&config, &stranger, &sealed, &dir.path().join("out"), &[], false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NotAuthorized(_))
        ));
    }

    #[test]
    fn test_replace_payload_failure_keeps_staged_copy() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("clip.rotating");
        std::fs::write(&staged, b"sealed under the new key").unwrap();

        // A non-empty directory cannot be replaced by a file.
        let payload = dir.path().join("clip.enc");
        std::fs::create_dir(&payload).unwrap();
        std::fs::write(payload.join("keep"), b"x").unwrap();

        let err = replace_payload(&staged, &payload).unwrap_err();
        assert!(format!("{:#}", err).contains(&staged.display().to_string()));
        assert!(staged.exists());
    }

    #[test]
    fn test_rotate_abort_leaves_no_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), None);
        let plain = dir.path().join("clip.raw");
        let sealed = dir.path().join("clip.enc");
        std::fs::write(&plain, b"frames").unwrap();
        cmd_encrypt(&config, 10, &plain, &sealed, None, false).unwrap();

        // Wrong format flag: re-encryption fails before anything commits.
        assert!(cmd_rotate(&config, 10, &sealed, true).is_err());
        assert!(!sealed.with_extension("rotating").exists());

        let out = dir.path().join("out");
        cmd_decrypt(&config, 10, &sealed, &out, &[], false).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"frames");
    }

    #[test]
    fn test_gated_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), None);

        let plain = dir.path().join("clip.raw");
        let sealed = dir.path().join("clip.enc");
        let opened = dir.path().join("clip.out");
        std::fs::write(&plain, vec![9u8; 200_000]).unwrap();

        cmd_encrypt(&config, 10, &plain, &sealed, None, true).unwrap();
        cmd_share(&config, 10, &[5], 3, None).unwrap();

        let request = |user| RequestArgs {
            resource: 10,
            user,
            role: "user".to_string(),
            owner: 3,
            approvals: vec![],
        };
        cmd_open(&config, &request(5), &sealed, &opened, &[], true).unwrap();
        assert_eq!(std::fs::read(&opened).unwrap(), vec![9u8; 200_000]);

        assert!(cmd_open(&config, &request(6), &sealed, &opened, &[], true).is_err());

        cmd_rotate(&config, 10, &sealed, true).unwrap();
        cmd_open(&config, &request(3), &sealed, &opened, &[], true).unwrap();
        assert_eq!(std::fs::read(&opened).unwrap(), vec![9u8; 200_000]);
    }
}
