//! Downstream assembly, run by the jockey once every shard has arrived.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use super::config::AssemblyConfig;
use super::errors::{RelayError, Result};

pub trait Assembler {
    fn persist_shard(&self, name: &str, bytes: &[u8]) -> Result<PathBuf>;
    fn concatenate(&self, name: &str, parts: &[PathBuf]) -> Result<PathBuf>;
    fn mux_audio(&self, name: &str, video: &Path, audio: &Path) -> Result<PathBuf>;
    fn play(&self, path: &Path) -> Result<()>;
}

/// Writes every intermediate into a work directory and shells out for muxing
/// and playback.
#[derive(Clone, Debug)]
pub struct FileAssembler {
    work_dir: PathBuf,
    extension: String,
    mux_command: Vec<String>,
    player_command: Vec<String>,
}

impl FileAssembler {
    pub fn new(work_dir: impl Into<PathBuf>, extension: impl Into<String>) -> FileAssembler {
        FileAssembler {
            work_dir: work_dir.into(),
            extension: extension.into(),
            mux_command: Vec::new(),
            player_command: Vec::new(),
        }
    }

    pub fn from_config(cfg: &AssemblyConfig, extension: &str) -> FileAssembler {
        FileAssembler {
            work_dir: PathBuf::from(&cfg.work_dir),
            extension: extension.to_string(),
            mux_command: cfg.mux_command.clone(),
            player_command: cfg.player_command.clone(),
        }
    }

    pub fn with_mux_command(mut self, argv: Vec<String>) -> Self {
        self.mux_command = argv;
        self
    }

    pub fn with_player_command(mut self, argv: Vec<String>) -> Self {
        self.player_command = argv;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Removes leftovers of an earlier run: plain files directly inside the
    /// work directory that carry the shard extension. Subdirectories and
    /// other files are left alone.
    pub fn clean(&self) -> Result<()> {
        fs::create_dir_all(&self.work_dir).map_err(|e| RelayError::io(&self.work_dir, e))?;
        let entries = fs::read_dir(&self.work_dir).map_err(|e| RelayError::io(&self.work_dir, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| RelayError::io(&self.work_dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| RelayError::io(&path, e))?;
            if !file_type.is_file() || !self.is_own_output(&path) {
                continue;
            }
            fs::remove_file(&path).map_err(|e| RelayError::io(&path, e))?;
            removed += 1;
        }
        debug!("removed {} files from {}", removed, self.work_dir.display());
        Ok(())
    }

    fn is_own_output(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.len() > self.extension.len() && name.ends_with(&self.extension))
    }

    fn output_path(&self, name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.work_dir).map_err(|e| RelayError::io(&self.work_dir, e))?;
        Ok(self.work_dir.join(format!("{}{}", name, self.extension)))
    }
}

fn run_command(argv: &[String], substitutions: &[(&str, &Path)]) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RelayError::Assembly("no command configured".to_string()))?;
    let args: Vec<String> = args
        .iter()
        .map(|arg| {
            substitutions.iter().fold(arg.clone(), |acc, (key, path)| {
                acc.replace(key, &path.to_string_lossy())
            })
        })
        .collect();
    debug!("running {} {:?}", program, args);
    let status = Command::new(program)
        .args(&args)
        .status()
        .map_err(|e| RelayError::io(program, e))?;
    if !status.success() {
        return Err(RelayError::Assembly(format!("{} exited with {}", program, status)));
    }
    Ok(())
}

impl Assembler for FileAssembler {
    fn persist_shard(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.output_path(name)?;
        fs::write(&path, bytes).map_err(|e| RelayError::io(&path, e))?;
        Ok(path)
    }

    fn concatenate(&self, name: &str, parts: &[PathBuf]) -> Result<PathBuf> {
        if parts.is_empty() {
            return Err(RelayError::Assembly(format!("nothing to concatenate into {}", name)));
        }
        let path = self.output_path(name)?;
        let file = File::create(&path).map_err(|e| RelayError::io(&path, e))?;
        let mut writer = BufWriter::new(file);
        for part in parts {
            let bytes = fs::read(part).map_err(|e| RelayError::io(part, e))?;
            writer.write_all(&bytes).map_err(|e| RelayError::io(&path, e))?;
        }
        writer.flush().map_err(|e| RelayError::io(&path, e))?;
        info!("concatenated {} parts into {}", parts.len(), path.display());
        Ok(path)
    }

    fn mux_audio(&self, name: &str, video: &Path, audio: &Path) -> Result<PathBuf> {
        let output = self.output_path(name)?;
        run_command(
            &self.mux_command,
            &[("{video}", video), ("{audio}", audio), ("{output}", output.as_path())],
        )?;
        Ok(output)
    }

    fn play(&self, path: &Path) -> Result<()> {
        run_command(&self.player_command, &[("{input}", path)])
    }
}

/// Persists every shard, joins them, adds audio when configured and optionally
/// plays the result. Returns the final file.
pub fn assemble(assembler: &dyn Assembler, shards: &[Vec<u8>], cfg: &AssemblyConfig) -> Result<PathBuf> {
    let mut parts = Vec::with_capacity(shards.len());
    for (shard_id, bytes) in shards.iter().enumerate() {
        parts.push(assembler.persist_shard(&format!("shard_{:04}", shard_id), bytes)?);
    }
    let mut output = assembler.concatenate(&cfg.output_name, &parts)?;
    if let Some(audio) = &cfg.audio_path {
        info!("adding audio {} to {}", audio, output.display());
        output = assembler.mux_audio("video_with_audio", &output, Path::new(audio))?;
    }
    if cfg.play {
        info!("playing {}", output.display());
        assembler.play(&output)?;
    }
    Ok(output)
}
