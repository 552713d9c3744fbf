//! Command execution.

use crate::Commands;
use colored::Colorize;
use mflux_client::input::crc32_file;
use mflux_client::{Connection, Input, Output, XmlElement, XmlWriter};
use std::path::{Path, PathBuf};

type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub fn execute(conn: &Connection, cmd: Commands, namespace: &str) -> CommandResult<String> {
    match cmd {
        Commands::MfVersion => {
            let result = conn.execute("server.version", None, &[], &mut [])?;
            let version = result.value("version")?.unwrap_or_default();
            Ok(format!(
                "{}\n{}\n{}",
                "== Mediaflux version information ==".bold(),
                result,
                version.cyan()
            ))
        }

        Commands::Create { file: None } => {
            let name = format!(
                "mflux-{}",
                chrono::Local::now().format("%Y-%m-%d %H-%M-%S%.6f")
            );
            let args = create_args(&name, namespace, Some("this is a note"))?;
            let result = conn.execute("asset.create", Some(&args), &[], &mut [])?;
            Ok(format!(
                "{} asset {} in {}: {}",
                "Created".green(),
                name.cyan(),
                namespace,
                result.value("id")?.unwrap_or_default()
            ))
        }

        Commands::Create { file: Some(path) } => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| format!("not a file: {}", path.display()))?;
            let args = create_args(&name, namespace, None)?;
            let inputs = [Input::from_path(&path)?];
            let result = conn.execute("asset.create", Some(&args), &inputs, &mut [])?;
            Ok(format!(
                "{} asset {} from {}: {}",
                "Created".green(),
                name.cyan(),
                path.display(),
                result.value("id")?.unwrap_or_default()
            ))
        }

        Commands::Get { id, output: None } => {
            let result = conn.execute("asset.get", Some(&id_args(&id)?), &[], &mut [])?;
            let asset = result
                .element("asset")?
                .ok_or_else(|| format!("no metadata returned for asset {}", id))?;
            Ok(format!(
                "{}\n{}\n{}",
                format!("== Asset metadata for {} ==", id).bold(),
                asset,
                asset.value("name")?.unwrap_or_default()
            ))
        }

        Commands::Get {
            id,
            output: Some(path),
        } => {
            let mut outputs = [Output::to_path(&path)];
            let result = conn.execute("asset.get", Some(&id_args(&id)?), &[], &mut outputs)?;
            let asset = result.element("asset")?.cloned().unwrap_or_default();
            Ok(format!(
                "{}\n{}",
                format!(
                    "== Saved content from asset {} into file {} ==",
                    id,
                    path.display()
                )
                .bold(),
                asset
            ))
        }

        Commands::Update { id } => {
            let result = conn.execute("asset.get", Some(&id_args(&id)?), &[], &mut [])?;
            let name = result.value("asset/name")?.unwrap_or_default();
            let note = format!(
                "this is an updated note {}",
                chrono::Local::now().format("%Y-%m-%d %H-%M-%S%.6f")
            );
            let args = set_args(&id, &name, &note)?;
            conn.execute("asset.set", Some(&args), &[], &mut [])?;
            Ok(format!(
                "{} asset {} ({})",
                "Updated".green(),
                id,
                name.cyan()
            ))
        }

        Commands::CheckUpload {
            directory,
            namespace: target,
        } => {
            let target = target.as_deref().unwrap_or(namespace);
            check_upload(conn, &directory, target)
        }

        Commands::Other(args) => Ok(unknown_action(&args)),
    }
}

/// Help text for unknown or missing actions.
pub fn usage() -> String {
    [
        "syntax:",
        "    mflux action [id] [file]",
        "",
        "Valid actions:",
        "    mf-version",
        "    create [file]",
        "    get <id> [file]",
        "    update <id>",
        "    check-upload <directory> [namespace]",
        "",
        "id represents an existing valid asset id and is required for get and update",
    ]
    .join("\n")
}

/// Usage text headed by the action that was not recognised.
pub fn unknown_action(args: &[String]) -> String {
    match args.first() {
        Some(action) => format!("{} {}\n\n{}", "Unknown action:".red(), action, usage()),
        None => usage(),
    }
}

fn create_args(name: &str, namespace: &str, note: Option<&str>) -> CommandResult<XmlElement> {
    let mut w = XmlWriter::new("args");
    w.add_with("namespace", namespace, &[("create", Some("true"))]);
    w.add("name", name);
    w.push("meta");
    w.push("mf-name").add("name", name).pop();
    if let Some(note) = note {
        w.push("mf-note").add("note", note).pop();
    }
    Ok(w.doc_elem()?)
}

fn id_args(id: &str) -> CommandResult<XmlElement> {
    let mut w = XmlWriter::new("args");
    w.add("id", id);
    Ok(w.doc_elem()?)
}

fn set_args(id: &str, name: &str, note: &str) -> CommandResult<XmlElement> {
    let mut w = XmlWriter::new("args");
    w.add("id", id);
    w.add("name", name);
    w.push("meta");
    w.push("mf-name").add("name", name).pop();
    w.push("mf-note").add("note", note).pop();
    Ok(w.doc_elem()?)
}

/// Tallies of a local-to-remote comparison.
#[derive(Debug, Default, PartialEq, Eq)]
struct UploadCheck {
    files: usize,
    assets: usize,
    missing: usize,
    mismatch: usize,
    matched: usize,
}

/// Compares every file under `directory` with the asset at the matching
/// path under `namespace`, by CRC32.
fn check_upload(conn: &Connection, directory: &Path, namespace: &str) -> CommandResult<String> {
    let mut report = String::new();
    let mut tally = UploadCheck::default();

    for file in list_files(directory)? {
        tally.files += 1;
        let asset_path = asset_path(&file, directory, namespace)?;
        let id = format!("path={}", asset_path);

        let exists = conn
            .execute("asset.exists", Some(&id_args(&id)?), &[], &mut [])?
            .bool_value("exists")?
            .unwrap_or(false);
        if !exists {
            tally.missing += 1;
            report.push_str(&format!("asset: '{}' does not exist.\n", asset_path).red().to_string());
            continue;
        }

        tally.assets += 1;
        let file_crc = crc32_file(&file)?;
        let asset_crc = conn
            .execute("asset.get", Some(&id_args(&id)?), &[], &mut [])?
            .int_value("asset/content/csum[@base='10']")?;
        if asset_crc != Some(i64::from(file_crc)) {
            tally.mismatch += 1;
            report.push_str(
                &format!(
                    "asset: '{}' (crc32={}) does not match file: '{}' (crc32={})\n",
                    asset_path,
                    asset_crc.map_or_else(|| "none".to_string(), |c| c.to_string()),
                    file.display(),
                    file_crc
                )
                .yellow()
                .to_string(),
            );
        } else {
            tally.matched += 1;
            report.push_str(&format!(
                "asset: '{}' matches file: '{}' (crc32={})\n",
                asset_path,
                file.display(),
                file_crc
            ));
        }
    }

    report.push_str(&format!(
        "\ntotal number of (local) files: {}\n\
         total number of (mediaflux) assets: {}\n\
         number of files missing: {}\n\
         number of files mismatch: {}\n\
         number of files matched: {}",
        tally.files, tally.assets, tally.missing, tally.mismatch, tally.matched
    ));
    Ok(report)
}

/// Every regular file below `dir`, sorted.
fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Asset path for `file`, mirroring its position below `base`.
fn asset_path(file: &Path, base: &Path, namespace: &str) -> CommandResult<String> {
    let relative = file.strip_prefix(base)?;
    let relative: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(format!(
        "{}/{}",
        namespace.trim_end_matches('/'),
        relative.join("/")
    ))
}
