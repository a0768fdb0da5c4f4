use std::path::{Path, PathBuf};

use crate::config::FfmpegSection;

use super::{TranscodeError, TranscodeInput, TranscodeResult};

pub const CONCAT_LIST_NAME: &str = "concat.txt";
const SEGMENT_PATTERN: &str = "segment_%05d.ts";
const CONCAT_PROTOCOLS: &str = "file,http,https,tcp,tls,crypto";

/// A fully resolved transcoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Concat demuxer list to write before the process starts, as
    /// `(path, contents)`.
    pub concat_list: Option<(PathBuf, String)>,
}

impl TranscodeCommand {
    pub fn display(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg: PathBuf,
    base_args: Vec<String>,
    transcode_args: Vec<String>,
}

impl CommandBuilder {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            base_args: Vec::new(),
            transcode_args: Vec::new(),
        }
    }

    pub fn from_config(section: &FfmpegSection) -> Self {
        Self::new(&section.ffmpeg_path)
            .with_base_args(section.base_args.clone())
            .with_transcode_args(section.transcode_args.clone())
    }

    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    pub fn with_transcode_args(mut self, args: Vec<String>) -> Self {
        self.transcode_args = args;
        self
    }

    /// Builds the command writing an HLS playlist at `output`, with segments
    /// next to it. Several inputs go through the concat demuxer in the order
    /// given.
    pub fn build(
        &self,
        inputs: &[&TranscodeInput],
        output: &Path,
    ) -> TranscodeResult<TranscodeCommand> {
        let stream_dir = output
            .parent()
            .filter(|_| output.file_name().is_some())
            .ok_or_else(|| TranscodeError::InvalidOutput(output.to_path_buf()))?;

        let mut args = self.base_args.clone();
        let mut concat_list = None;
        match inputs {
            [] => return Err(TranscodeError::NoInputs(output.to_path_buf())),
            [single] => {
                args.push("-i".to_string());
                args.push(single.uri.clone());
            }
            many => {
                let list_path = stream_dir.join(CONCAT_LIST_NAME);
                let contents: String = many
                    .iter()
                    .map(|input| format!("file '{}'\n", escape_concat(&input.uri)))
                    .collect();
                args.push("-f".to_string());
                args.push("concat".to_string());
                args.push("-safe".to_string());
                args.push("0".to_string());
                args.push("-protocol_whitelist".to_string());
                args.push(CONCAT_PROTOCOLS.to_string());
                args.push("-i".to_string());
                args.push(list_path.to_string_lossy().to_string());
                concat_list = Some((list_path, contents));
            }
        }

        args.extend(self.transcode_args.iter().cloned());
        args.push("-hls_segment_filename".to_string());
        args.push(stream_dir.join(SEGMENT_PATTERN).to_string_lossy().to_string());
        args.push(output.to_string_lossy().to_string());

        Ok(TranscodeCommand {
            program: self.ffmpeg.clone(),
            args,
            working_dir: stream_dir.to_path_buf(),
            concat_list,
        })
    }
}

// Single quotes cannot be escaped inside a quoted concat entry; close the
// quote, emit an escaped quote and reopen.
fn escape_concat(uri: &str) -> String {
    uri.replace('\'', r"'\''")
}
