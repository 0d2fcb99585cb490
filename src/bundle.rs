//! Command bundles
//!
//! A bundle is an entry command plus the files it needs. It ships to the node
//! as one gzipped tarball holding the files and a generated `__run.sh` that
//! marks the executable files and invokes the entry command.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Component, Path};
use walkdir::WalkDir;

use crate::command::{escape, CommandArg, FormattedCommand};
use crate::error::{ProxyError, Result};

/// Name of the generated entry script inside the bundle folder
pub const RUN_SCRIPT: &str = "__run.sh";

/// Name of the uploaded archive inside the bundle folder
pub const ARCHIVE_NAME: &str = "__bundle.tar.gz";

/// One file in a bundle. Exactly one of `text` and `data` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFile {
    /// Path relative to the bundle folder
    pub path: String,
    /// Mark the file executable before running the entry command
    pub executable: bool,
    /// Text payload; line endings are normalized to LF
    pub text: Option<String>,
    /// Binary payload
    pub data: Option<Vec<u8>>,
}

impl CommandFile {
    pub fn text(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn binary(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    /// Check payload exclusivity and path shape
    pub fn validate(&self) -> Result<()> {
        match (&self.text, &self.data) {
            (Some(_), Some(_)) => {
                return Err(ProxyError::InvalidBundle(format!(
                    "[{}] has both text and binary content",
                    self.path
                )))
            }
            (None, None) => {
                return Err(ProxyError::InvalidBundle(format!(
                    "[{}] has no content",
                    self.path
                )))
            }
            _ => {}
        }

        if self.path.trim().is_empty() {
            return Err(ProxyError::InvalidBundle("file path is empty".to_string()));
        }

        if self.path.starts_with('/') {
            return Err(ProxyError::InvalidBundle(format!(
                "[{}] must be relative",
                self.path
            )));
        }

        if Path::new(&self.path)
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(ProxyError::InvalidBundle(format!(
                "[{}] escapes the bundle folder",
                self.path
            )));
        }

        if self.path == RUN_SCRIPT || self.path == ARCHIVE_NAME {
            return Err(ProxyError::InvalidBundle(format!(
                "[{}] is reserved",
                self.path
            )));
        }

        Ok(())
    }

    fn payload(&self) -> Vec<u8> {
        match (&self.text, &self.data) {
            (Some(text), _) => text.replace("\r\n", "\n").into_bytes(),
            (None, Some(data)) => data.clone(),
            (None, None) => Vec::new(),
        }
    }
}

/// Entry command plus supporting files
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBundle {
    command: String,
    args: Vec<CommandArg>,
    files: Vec<CommandFile>,
}

impl CommandBundle {
    pub fn new(command: impl Into<String>, args: Vec<CommandArg>) -> Self {
        Self {
            command: command.into(),
            args,
            files: Vec::new(),
        }
    }

    /// Add a text file
    pub fn add_file(&mut self, path: impl Into<String>, text: impl Into<String>, executable: bool) {
        let mut file = CommandFile::text(path, text);
        file.executable = executable;
        self.files.push(file);
    }

    /// Add a binary file
    pub fn add_binary(&mut self, path: impl Into<String>, data: impl Into<Vec<u8>>, executable: bool) {
        let mut file = CommandFile::binary(path, data);
        file.executable = executable;
        self.files.push(file);
    }

    /// Add a prebuilt file entry; validated with the rest of the bundle
    pub fn push(&mut self, file: CommandFile) {
        self.files.push(file);
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn files(&self) -> &[CommandFile] {
        &self.files
    }

    /// The entry command as it appears in `__run.sh`
    pub fn formatted(&self) -> FormattedCommand {
        FormattedCommand::new(self.command.clone(), &self.args)
    }

    /// Validate every file and reject duplicate paths
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ProxyError::InvalidBundle("entry command is empty".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for file in &self.files {
            file.validate()?;
            if !seen.insert(file.path.as_str()) {
                return Err(ProxyError::InvalidBundle(format!(
                    "[{}] appears more than once",
                    file.path
                )));
            }
        }
        Ok(())
    }

    /// Generate `__run.sh`. Elevated bundles open executables to everyone.
    pub fn run_script(&self, elevated: bool) -> String {
        let mode = if elevated { "777" } else { "700" };
        let mut script = String::from("#!/bin/bash\n");

        for file in self.files.iter().filter(|file| file.executable) {
            script.push_str(&format!("chmod {} {}\n", mode, escape(&file.path)));
        }

        script.push_str(&self.formatted().command_line());
        script.push('\n');
        script
    }

    /// Validate and pack the bundle as a gzipped tarball
    pub fn to_archive(&self, elevated: bool) -> Result<Vec<u8>> {
        self.validate()?;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for file in &self.files {
            let payload = file.payload();
            append(&mut builder, &file.path, &payload, 0o644)?;
        }

        let script = self.run_script(elevated);
        append(&mut builder, RUN_SCRIPT, script.as_bytes(), 0o700)?;

        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Package every regular file under `dir`, keeping the local executable bit
    pub fn from_directory(dir: &Path, command: impl Into<String>, args: Vec<CommandArg>) -> Result<Self> {
        let mut bundle = CommandBundle::new(command, args);

        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| ProxyError::InvalidBundle(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| ProxyError::InvalidBundle(e.to_string()))?;
            let path = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            let data = std::fs::read(entry.path())?;
            let executable = is_executable(&entry.metadata().map_err(|e| {
                ProxyError::InvalidBundle(format!("{}: {}", entry.path().display(), e))
            })?);

            bundle.add_binary(path, data, executable);
        }

        bundle.validate()?;
        Ok(bundle)
    }
}

fn append<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use flate2::read::GzDecoder;
    use std::collections::HashMap;
    use std::io::Read;

    fn unpack(archive: &[u8]) -> HashMap<String, (Vec<u8>, u32)> {
        let mut entries = HashMap::new();
        let mut archive = tar::Archive::new(GzDecoder::new(archive));
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.insert(path, (data, mode));
        }
        entries
    }

    #[test]
    fn test_file_with_both_payloads_is_rejected() {
        let file = CommandFile {
            path: "setup.sh".to_string(),
            executable: true,
            text: Some("echo hi".to_string()),
            data: Some(vec![1, 2, 3]),
        };
        assert!(matches!(file.validate(), Err(ProxyError::InvalidBundle(_))));

        let mut bundle = CommandBundle::new("./setup.sh", args![]);
        bundle.push(file);
        assert!(bundle.to_archive(false).is_err());
    }

    #[test]
    fn test_file_without_payload_is_rejected() {
        let file = CommandFile {
            path: "empty".to_string(),
            ..Default::default()
        };
        assert!(file.validate().is_err());
    }

    #[test]
    fn test_absolute_and_escaping_paths_rejected() {
        assert!(CommandFile::text("/etc/passwd", "x").validate().is_err());
        assert!(CommandFile::text("../outside", "x").validate().is_err());
        assert!(CommandFile::text("conf/../../x", "x").validate().is_err());
        assert!(CommandFile::text(RUN_SCRIPT, "x").validate().is_err());
        assert!(CommandFile::text("conf/app.yaml", "x").validate().is_ok());
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let mut bundle = CommandBundle::new("true", args![]);
        bundle.add_file("a.txt", "1", false);
        bundle.add_file("a.txt", "2", false);
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn test_run_script_user() {
        let mut bundle = CommandBundle::new("./install.sh", args!["--mode", "fast lane", true]);
        bundle.add_file("install.sh", "#!/bin/bash\necho ok\n", true);
        bundle.add_file("config.yaml", "a: 1\n", false);

        assert_eq!(
            bundle.run_script(false),
            "#!/bin/bash\nchmod 700 install.sh\n./install.sh --mode \"fast lane\" true\n"
        );
    }

    #[test]
    fn test_run_script_elevated() {
        let mut bundle = CommandBundle::new("./install.sh", args![]);
        bundle.add_file("bin/install.sh", "echo ok", true);
        assert!(bundle.run_script(true).contains("chmod 777 bin/install.sh\n"));
    }

    #[test]
    fn test_archive_contents() {
        let mut bundle = CommandBundle::new("./run.sh", args![vec!["a", "b"]]);
        bundle.add_file("run.sh", "#!/bin/bash\r\necho $@\r\n", true);
        bundle.add_binary("blob.bin", vec![0u8, 1, 2, 255], false);

        let entries = unpack(&bundle.to_archive(false).unwrap());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["run.sh"].0, b"#!/bin/bash\necho $@\n");
        assert_eq!(entries["blob.bin"].0, vec![0u8, 1, 2, 255]);

        let (script, mode) = &entries[RUN_SCRIPT];
        assert_eq!(*mode, 0o700);
        assert!(String::from_utf8_lossy(script).ends_with("./run.sh a b\n"));
    }

    #[test]
    fn test_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf").join("app.yaml"), "a: 1").unwrap();
        std::fs::write(dir.path().join("tool.sh"), "echo tool").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = dir.path().join("tool.sh");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let bundle = CommandBundle::from_directory(dir.path(), "./tool.sh", args![]).unwrap();
        let paths: Vec<_> = bundle.files().iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["conf/app.yaml", "tool.sh"]);

        #[cfg(unix)]
        assert!(bundle.files()[1].executable);
        assert!(!bundle.files()[0].executable);
    }
}
