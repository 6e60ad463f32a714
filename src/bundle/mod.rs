//! Bundle codec: deterministic export manifest, staged ZIP archive,
//! optional AES-256-GCM+scrypt encryption, and an importer that
//! verifies every file's SHA-256 before it touches the vault.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{BundleError, CaamError};
use crate::provider::Provider;
use crate::util::atomic_write;
use crate::vault::Vault;

const SCRYPT_LOG_N: u8 = 15; // N = 2^15
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

fn io_err(e: std::io::Error) -> CaamError {
    CaamError::Bundle(BundleError::Io(e))
}

fn zip_err(e: zip::result::ZipError) -> CaamError {
    CaamError::Bundle(BundleError::Zip(e))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManifestEntry {
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, FileManifest>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultManifest {
    pub total_profiles: usize,
    pub profiles: BTreeMap<String, Vec<String>>,
    pub files: BTreeMap<String, FileManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestContents {
    pub vault: VaultManifest,
    pub config: ManifestEntry,
    pub projects: ManifestEntry,
    pub health: ManifestEntry,
    pub database: ManifestEntry,
    pub sync: ManifestEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub contents: ManifestContents,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptionMeta {
    #[serde(rename = "Algorithm")]
    pub algorithm: String,
    #[serde(rename = "KDF")]
    pub kdf: String,
    #[serde(rename = "N")]
    pub n: u32,
    pub r: u32,
    pub p: u32,
    #[serde(rename = "Salt")]
    pub salt: String,
    #[serde(rename = "Nonce")]
    pub nonce: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub providers: Option<Vec<Provider>>,
    pub include_config: Option<PathBuf>,
    pub include_projects: Option<PathBuf>,
    pub include_health: Option<PathBuf>,
    pub include_database: Option<PathBuf>,
    pub dry_run: bool,
    pub password: Option<String>,
    pub verbose_filename: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Replace,
    Merge,
    Smart,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub imported: Vec<(Provider, String)>,
    pub skipped: Vec<(Provider, String)>,
    pub merged: Vec<(Provider, String)>,
}

#[cfg(unix)]
fn hostname() -> String {
    use std::ffi::CStr;
    let mut buf = vec![0u8; 256];
    unsafe {
        if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
            return CStr::from_ptr(buf.as_ptr() as *const libc::c_char)
                .to_string_lossy()
                .into_owned();
        }
    }
    "unknown".to_string()
}

#[cfg(not(unix))]
fn hostname() -> String {
    "unknown".to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Copy a profile's snapshot directory into the staging tree, skipping
/// the advisory lock file (ephemeral, meaningless outside the process
/// that holds it).
fn copy_profile_snapshot(src: &Path, dst: &Path) -> Result<(), CaamError> {
    fs::create_dir_all(dst).map_err(io_err)?;
    for entry in fs::read_dir(src).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_name() == "profile.lock" {
            continue;
        }
        let dst_path = dst.join(entry.file_name());
        if entry.file_type().map_err(io_err)?.is_dir() {
            copy_profile_snapshot(&entry.path(), &dst_path)?;
        } else {
            let bytes = fs::read(entry.path()).map_err(io_err)?;
            atomic_write(&dst_path, &bytes, 0o600).map_err(io_err)?;
        }
    }
    Ok(())
}

fn walk_files(dir: &Path, root: &Path, out: &mut BTreeMap<String, FileManifest>) -> Result<(), CaamError> {
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if entry.file_type().map_err(io_err)?.is_dir() {
            walk_files(&path, root, out)?;
        } else {
            let bytes = fs::read(&path).map_err(io_err)?;
            let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
            out.insert(rel, FileManifest { size: bytes.len() as u64, sha256: sha256_hex(&bytes) });
        }
    }
    Ok(())
}

fn copy_optional_file(src: Option<&Path>, dst: &Path) -> Result<ManifestEntry, CaamError> {
    let Some(src) = src else { return Ok(ManifestEntry::default()) };
    if !src.exists() {
        return Ok(ManifestEntry::default());
    }
    let bytes = fs::read(src).map_err(io_err)?;
    atomic_write(dst, &bytes, 0o600).map_err(io_err)?;
    Ok(ManifestEntry { present: true, sha256: Some(sha256_hex(&bytes)), files: None })
}

fn copy_optional_projects(src: Option<&Path>, dst: &Path) -> Result<ManifestEntry, CaamError> {
    let Some(src) = src else { return Ok(ManifestEntry::default()) };
    if !src.exists() {
        return Ok(ManifestEntry::default());
    }
    fs::create_dir_all(dst).map_err(io_err)?;
    let mut files = BTreeMap::new();
    if src.is_dir() {
        for entry in fs::read_dir(src).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let bytes = fs::read(entry.path()).map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            atomic_write(&dst.join(&name), &bytes, 0o600).map_err(io_err)?;
            files.insert(name, FileManifest { size: bytes.len() as u64, sha256: sha256_hex(&bytes) });
        }
    } else {
        let bytes = fs::read(src).map_err(io_err)?;
        let name = src.file_name().unwrap_or_default().to_string_lossy().into_owned();
        atomic_write(&dst.join(&name), &bytes, 0o600).map_err(io_err)?;
        files.insert(name, FileManifest { size: bytes.len() as u64, sha256: sha256_hex(&bytes) });
    }
    Ok(ManifestEntry { present: true, sha256: None, files: Some(files) })
}

fn zip_directory(root: &Path) -> Result<Vec<u8>, CaamError> {
    let mut entries = BTreeMap::new();
    walk_files(root, root, &mut entries)?;
    let buf = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(buf);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for rel in entries.keys() {
        let bytes = fs::read(root.join(rel)).map_err(io_err)?;
        writer.start_file(rel, options).map_err(zip_err)?;
        writer.write_all(&bytes).map_err(io_err)?;
    }
    let cursor = writer.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}

fn export_filename(verbose: bool, encrypted: bool) -> String {
    let now = Utc::now();
    let base = if verbose {
        format!("Exported_Coding_Agent_Account_Auth_Info_{}", now.format("%Y-%m-%d_%H%M"))
    } else {
        format!("caam_export_{}", now.format("%Y-%m-%d_%H%M"))
    };
    if encrypted {
        format!("{base}.enc.zip")
    } else {
        format!("{base}.zip")
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CaamError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| CaamError::Bundle(BundleError::Decryption(format!("invalid scrypt params: {e}"))))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .map_err(|e| CaamError::Bundle(BundleError::Decryption(format!("key derivation failed: {e}"))))?;
    Ok(key)
}

fn encrypt_bundle(plaintext: &[u8], password: &str) -> Result<(Vec<u8>, EncryptionMeta), CaamError> {
    let mut salt = [0u8; SALT_LEN];
    rand::RngExt::fill(&mut rand::rng(), &mut salt);
    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CaamError::Bundle(BundleError::Decryption(format!("encryption failed: {e}"))))?;
    let meta = EncryptionMeta {
        algorithm: "aes-256-gcm".to_string(),
        kdf: "scrypt".to_string(),
        n: 1u32 << SCRYPT_LOG_N,
        r: SCRYPT_R,
        p: SCRYPT_P,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
    };
    Ok((ciphertext, meta))
}

fn decrypt_bundle(ciphertext: &[u8], meta: &EncryptionMeta, password: &str) -> Result<Vec<u8>, CaamError> {
    let salt = BASE64
        .decode(&meta.salt)
        .map_err(|e| CaamError::Bundle(BundleError::Decryption(format!("invalid salt: {e}"))))?;
    let nonce_bytes = BASE64
        .decode(&meta.nonce)
        .map_err(|e| CaamError::Bundle(BundleError::Decryption(format!("invalid nonce: {e}"))))?;
    let log_n = (meta.n as f64).log2().round() as u8;
    let params = scrypt::Params::new(log_n, meta.r, meta.p, KEY_LEN)
        .map_err(|e| CaamError::Bundle(BundleError::Decryption(format!("invalid scrypt params: {e}"))))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut key)
        .map_err(|e| CaamError::Bundle(BundleError::Decryption(format!("key derivation failed: {e}"))))?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
        .map_err(|_| CaamError::Bundle(BundleError::Decryption("wrong password or corrupted archive".to_string())))
}

/// Build the export manifest (and, unless `dry_run`, the archive on
/// disk). Returns the manifest plus the written file path.
pub fn export(vault: &Vault, dest_dir: &Path, opts: &ExportOptions) -> Result<(Manifest, Option<PathBuf>), CaamError> {
    let staging = tempfile::tempdir().map_err(io_err)?;
    let staging_path = staging.path();
    let vault_staging = staging_path.join("vault");

    let mut profiles_by_provider = BTreeMap::new();
    for provider in Provider::ALL {
        if let Some(allow) = &opts.providers {
            if !allow.contains(&provider) {
                continue;
            }
        }
        let names = vault.list(provider);
        if names.is_empty() {
            continue;
        }
        for name in &names {
            let src = vault.profile_path(provider, name);
            let dst = vault_staging.join(provider.as_str()).join(name);
            copy_profile_snapshot(&src, &dst)?;
        }
        profiles_by_provider.insert(provider.as_str().to_string(), names);
    }

    let mut vault_files = BTreeMap::new();
    if vault_staging.exists() {
        walk_files(&vault_staging, staging_path, &mut vault_files)?;
    }
    let total_profiles = profiles_by_provider.values().map(|v| v.len()).sum();

    let config_entry = copy_optional_file(opts.include_config.as_deref(), &staging_path.join("config.yaml"))?;
    let health_entry = copy_optional_file(opts.include_health.as_deref(), &staging_path.join("health.json"))?;
    let database_entry = copy_optional_file(opts.include_database.as_deref(), &staging_path.join("caam.db"))?;
    let projects_entry = copy_optional_projects(opts.include_projects.as_deref(), &staging_path.join("projects"))?;

    let manifest = Manifest {
        version: 1,
        created_at: Utc::now(),
        created_by: hostname(),
        contents: ManifestContents {
            vault: VaultManifest { total_profiles, profiles: profiles_by_provider, files: vault_files },
            config: config_entry,
            projects: projects_entry,
            health: health_entry,
            database: database_entry,
            sync: ManifestEntry::default(),
        },
    };

    if opts.dry_run {
        return Ok((manifest, None));
    }

    let manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding manifest: {e}")))?;
    fs::write(staging_path.join("manifest.json"), &manifest_bytes).map_err(io_err)?;

    let zip_bytes = zip_directory(staging_path)?;

    let filename = export_filename(opts.verbose_filename, opts.password.is_some());
    let dest_path = dest_dir.join(&filename);
    fs::create_dir_all(dest_dir).map_err(io_err)?;

    if let Some(password) = &opts.password {
        let (ciphertext, meta) = encrypt_bundle(&zip_bytes, password)?;
        atomic_write(&dest_path, &ciphertext, 0o600).map_err(io_err)?;
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding encryption sidecar: {e}")))?;
        let meta_path = PathBuf::from(format!("{}.meta", dest_path.display()));
        atomic_write(&meta_path, &meta_bytes, 0o600).map_err(io_err)?;
    } else {
        atomic_write(&dest_path, &zip_bytes, 0o600).map_err(io_err)?;
    }

    Ok((manifest, Some(dest_path)))
}

fn read_manifest(archive: &mut ZipArchive<Cursor<Vec<u8>>>) -> Result<Manifest, CaamError> {
    let mut file = archive
        .by_name("manifest.json")
        .map_err(|_| CaamError::Bundle(BundleError::InvalidManifest("manifest.json missing from archive".to_string())))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(io_err)?;
    serde_json::from_slice(&buf)
        .map_err(|e| CaamError::Bundle(BundleError::InvalidManifest(format!("malformed manifest.json: {e}"))))
}

fn collect_archive_files(
    archive: &mut ZipArchive<Cursor<Vec<u8>>>,
    prefix: &str,
) -> Result<BTreeMap<String, Vec<u8>>, CaamError> {
    let names: Vec<String> = archive.file_names().filter(|n| n.starts_with(prefix) && !n.ends_with('/')).map(String::from).collect();
    let mut out = BTreeMap::new();
    for name in names {
        let mut file = archive.by_name(&name).map_err(zip_err)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(io_err)?;
        let rel = name.trim_start_matches(prefix).to_string();
        out.insert(rel, buf);
    }
    Ok(out)
}

fn write_profile_files(dest_dir: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<(), CaamError> {
    for (rel, bytes) in files {
        atomic_write(&dest_dir.join(rel), bytes, 0o600).map_err(io_err)?;
    }
    Ok(())
}

/// Best-effort extraction of a freshness timestamp from a credential
/// JSON blob: looks for a top-level or one-level-nested
/// `expires_at`/`expiresAt`/`expiry` key, as an RFC3339 string or a
/// unix-seconds number.
fn extract_expiry(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    fn find(value: &serde_json::Value, depth: u8) -> Option<DateTime<Utc>> {
        if depth > 1 {
            return None;
        }
        if let serde_json::Value::Object(map) = value {
            for key in ["expires_at", "expiresAt", "expiry"] {
                if let Some(v) = map.get(key) {
                    if let Some(s) = v.as_str() {
                        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                            return Some(dt.with_timezone(&Utc));
                        }
                    }
                    if let Some(n) = v.as_i64() {
                        if let Some(dt) = DateTime::from_timestamp(n, 0) {
                            return Some(dt);
                        }
                    }
                }
            }
            for v in map.values() {
                if let Some(found) = find(v, depth + 1) {
                    return Some(found);
                }
            }
        }
        None
    }
    find(&value, 0)
}

fn read_dest_profile_expiry(dest_dir: &Path) -> Option<DateTime<Utc>> {
    let entries = fs::read_dir(dest_dir).ok()?;
    for entry in entries.flatten() {
        if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
            if let Ok(bytes) = fs::read(entry.path()) {
                if let Some(dt) = extract_expiry(&bytes) {
                    return Some(dt);
                }
            }
        }
    }
    None
}

/// Key-wise JSON merge (bundle values win on collision); a destination
/// file that fails to parse as JSON is replaced wholesale. Non-JSON
/// files are overwritten unconditionally.
fn smart_merge_profile(dest_dir: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<(), CaamError> {
    for (rel, bytes) in files {
        let dest_path = dest_dir.join(rel);
        let is_json = rel.ends_with(".json");
        if !is_json || !dest_path.exists() {
            atomic_write(&dest_path, bytes, 0o600).map_err(io_err)?;
            continue;
        }
        let incoming: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(_) => {
                atomic_write(&dest_path, bytes, 0o600).map_err(io_err)?;
                continue;
            }
        };
        let existing = fs::read(&dest_path).ok().and_then(|b| serde_json::from_slice::<serde_json::Value>(&b).ok());
        let merged = match (existing, &incoming) {
            (Some(serde_json::Value::Object(mut dest_map)), serde_json::Value::Object(incoming_map)) => {
                for (k, v) in incoming_map {
                    dest_map.insert(k.clone(), v.clone());
                }
                serde_json::Value::Object(dest_map)
            }
            _ => incoming,
        };
        let body = serde_json::to_vec_pretty(&merged)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding merged credential file: {e}")))?;
        atomic_write(&dest_path, &body, 0o600).map_err(io_err)?;
    }
    Ok(())
}

/// Import a bundle into `vault`. Every vault-file SHA-256 is verified
/// against the manifest before any write occurs.
pub fn import(
    vault: &Vault,
    bundle_path: &Path,
    password: Option<&str>,
    mode: ImportMode,
    providers: Option<&[Provider]>,
) -> Result<ImportSummary, CaamError> {
    let raw = fs::read(bundle_path).map_err(io_err)?;
    let is_encrypted = bundle_path.to_string_lossy().ends_with(".enc.zip");
    let zip_bytes = if is_encrypted {
        let meta_path = PathBuf::from(format!("{}.meta", bundle_path.display()));
        let meta_raw = fs::read(&meta_path).map_err(io_err)?;
        let meta: EncryptionMeta = serde_json::from_slice(&meta_raw)
            .map_err(|e| CaamError::Bundle(BundleError::InvalidManifest(format!("malformed encryption sidecar: {e}"))))?;
        let password = password.ok_or(CaamError::Bundle(BundleError::MissingPassword))?;
        decrypt_bundle(&raw, &meta, password)?
    } else {
        raw
    };

    let mut archive = ZipArchive::new(Cursor::new(zip_bytes)).map_err(zip_err)?;
    let manifest = read_manifest(&mut archive)?;

    // Verify every recorded vault file before any vault write.
    for (archive_path, file_manifest) in &manifest.contents.vault.files {
        let full_path = format!("vault/{archive_path}");
        let mut zf = archive
            .by_name(&full_path)
            .map_err(|_| CaamError::Bundle(BundleError::InvalidManifest(format!("missing file in archive: {full_path}"))))?;
        let mut buf = Vec::new();
        zf.read_to_end(&mut buf).map_err(io_err)?;
        let got = sha256_hex(&buf);
        if got != file_manifest.sha256 {
            return Err(CaamError::Bundle(BundleError::Verification {
                file: full_path,
                expected_sha: file_manifest.sha256.clone(),
                got_sha: got,
            }));
        }
    }

    let mut summary = ImportSummary::default();
    for (provider_str, names) in &manifest.contents.vault.profiles {
        let Some(provider) = Provider::parse(provider_str) else { continue };
        if let Some(allow) = providers {
            if !allow.contains(&provider) {
                continue;
            }
        }
        for name in names {
            let prefix = format!("vault/{}/{}/", provider.as_str(), name);
            let files = collect_archive_files(&mut archive, &prefix)?;
            let dest_dir = vault.profile_path(provider, name);
            let exists = dest_dir.exists();

            match mode {
                ImportMode::Merge if exists => summary.skipped.push((provider, name.clone())),
                ImportMode::Replace | ImportMode::Merge => {
                    write_profile_files(&dest_dir, &files)?;
                    summary.imported.push((provider, name.clone()));
                }
                ImportMode::Smart => {
                    let bundle_expiry = files.values().find_map(|b| extract_expiry(b));
                    let dest_expiry = if exists { read_dest_profile_expiry(&dest_dir) } else { None };
                    if exists && dest_expiry.is_some() && bundle_expiry.is_some() && dest_expiry > bundle_expiry {
                        summary.skipped.push((provider, name.clone()));
                    } else if exists {
                        smart_merge_profile(&dest_dir, &files)?;
                        summary.merged.push((provider, name.clone()));
                    } else {
                        write_profile_files(&dest_dir, &files)?;
                        summary.imported.push((provider, name.clone()));
                    }
                }
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codex_vault() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(home.join(".codex")).unwrap();
        fs::write(home.join(".codex/auth.json"), br#"{"access_token":"a1","expires_at":"2030-01-01T00:00:00Z"}"#).unwrap();
        let vault = Vault::new(dir.path().join("vault"), home);
        vault.backup(Provider::Codex, "alice").unwrap();
        (dir, vault)
    }

    #[test]
    fn dry_run_builds_manifest_without_writing_archive() {
        let (_dir, vault) = codex_vault();
        let out_dir = tempfile::tempdir().unwrap();
        let opts = ExportOptions { dry_run: true, ..Default::default() };
        let (manifest, path) = export(&vault, out_dir.path(), &opts).unwrap();
        assert!(path.is_none());
        assert_eq!(manifest.contents.vault.total_profiles, 1);
        assert!(manifest.contents.vault.files.keys().any(|k| k.contains("auth.json")));
    }

    #[test]
    fn export_then_import_round_trips_into_a_fresh_vault() {
        let (_dir, vault) = codex_vault();
        let out_dir = tempfile::tempdir().unwrap();
        let opts = ExportOptions::default();
        let (_manifest, path) = export(&vault, out_dir.path(), &opts).unwrap();
        let path = path.unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        let dest_vault = Vault::new(dest_dir.path().join("vault"), dest_dir.path().join("home"));
        let summary = import(&dest_vault, &path, None, ImportMode::Replace, None).unwrap();
        assert_eq!(summary.imported, vec![(Provider::Codex, "alice".to_string())]);
        assert_eq!(dest_vault.list(Provider::Codex), vec!["alice".to_string()]);
    }

    #[test]
    fn encrypted_round_trip_requires_correct_password() {
        let (_dir, vault) = codex_vault();
        let out_dir = tempfile::tempdir().unwrap();
        let opts = ExportOptions { password: Some("hunter2".to_string()), ..Default::default() };
        let (_manifest, path) = export(&vault, out_dir.path(), &opts).unwrap();
        let path = path.unwrap();
        assert!(path.to_string_lossy().ends_with(".enc.zip"));

        let dest_dir = tempfile::tempdir().unwrap();
        let dest_vault = Vault::new(dest_dir.path().join("vault"), dest_dir.path().join("home"));

        let err = import(&dest_vault, &path, Some("wrong"), ImportMode::Replace, None).unwrap_err();
        assert!(matches!(err, CaamError::Bundle(BundleError::Decryption(_))));

        let summary = import(&dest_vault, &path, Some("hunter2"), ImportMode::Replace, None).unwrap();
        assert_eq!(summary.imported.len(), 1);
    }

    #[test]
    fn tampered_archive_fails_verification_before_any_write() {
        let (_dir, vault) = codex_vault();
        let out_dir = tempfile::tempdir().unwrap();
        let (_manifest, path) = export(&vault, out_dir.path(), &ExportOptions::default()).unwrap();
        let path = path.unwrap();

        // Corrupt the archive bytes so the checksum no longer matches.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).ok(); // may produce an invalid zip; either error is acceptable

        let dest_dir = tempfile::tempdir().unwrap();
        let dest_vault = Vault::new(dest_dir.path().join("vault"), dest_dir.path().join("home"));
        let result = import(&dest_vault, &path, None, ImportMode::Replace, None);
        assert!(result.is_err());
        assert!(dest_vault.list(Provider::Codex).is_empty());
    }

    #[test]
    fn provider_filter_excludes_other_providers_on_export() {
        let (_dir, vault) = codex_vault();
        let out_dir = tempfile::tempdir().unwrap();
        let opts = ExportOptions { providers: Some(vec![Provider::Gemini]), ..Default::default() };
        let (manifest, _path) = export(&vault, out_dir.path(), &opts).unwrap();
        assert_eq!(manifest.contents.vault.total_profiles, 0);
    }

    #[test]
    fn smart_mode_skips_when_destination_is_fresher() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(home.join(".codex")).unwrap();
        fs::write(home.join(".codex/auth.json"), br#"{"expires_at":"2020-01-01T00:00:00Z"}"#).unwrap();
        let vault = Vault::new(dir.path().join("vault"), home);
        vault.backup(Provider::Codex, "alice").unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let (_m, path) = export(&vault, out_dir.path(), &ExportOptions::default()).unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        let dest_home = dest_dir.path().join("home");
        fs::create_dir_all(dest_home.join(".codex")).unwrap();
        fs::write(dest_home.join(".codex/auth.json"), br#"{"expires_at":"2030-01-01T00:00:00Z"}"#).unwrap();
        let dest_vault = Vault::new(dest_dir.path().join("vault"), dest_home);
        dest_vault.backup(Provider::Codex, "alice").unwrap();

        let summary = import(&dest_vault, &path.unwrap(), None, ImportMode::Smart, None).unwrap();
        assert_eq!(summary.skipped, vec![(Provider::Codex, "alice".to_string())]);
    }
}
