//! Alert playback through an external player process (`ffplay` by default).

use std::{
    path::Path,
    process::{Child, Command, Stdio},
};

use tracing::debug;

use crate::pipeline::{error::PlaybackError, notify::SoundPlayer};

/// Plays alert files through an external player process.
pub struct CommandSoundPlayer {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl CommandSoundPlayer {
    /// `program args... <file>` is run for every alert.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
        }
    }

    /// `ffplay -nodisp -autoexit -loglevel quiet <file>`
    pub fn ffplay() -> Self {
        Self::new(
            "ffplay",
            ["-nodisp", "-autoexit", "-loglevel", "quiet"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }

    /// Build an ffplay-backed player after checking the alert file exists.
    pub fn for_file(sound_file: &Path) -> Result<Self, PlaybackError> {
        if !sound_file.is_file() {
            return Err(PlaybackError::MissingFile(sound_file.to_path_buf()));
        }
        Ok(Self::ffplay())
    }
}

impl SoundPlayer for CommandSoundPlayer {
    fn play(&mut self, path: &Path) -> Result<(), PlaybackError> {
        if !path.is_file() {
            return Err(PlaybackError::MissingFile(path.to_path_buf()));
        }
        self.stop();
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| PlaybackError::Launch {
                program: self.program.clone(),
                source,
            })?;
        debug!("started {} (pid {})", self.program, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn is_playing(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => {
                self.child = None;
                false
            }
        }
    }
}

impl Drop for CommandSoundPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.mp3");
        assert!(matches!(
            CommandSoundPlayer::for_file(&missing),
            Err(PlaybackError::MissingFile(_))
        ));
        let mut player = CommandSoundPlayer::ffplay();
        assert!(matches!(
            player.play(&missing),
            Err(PlaybackError::MissingFile(_))
        ));
    }

    #[test]
    fn unknown_program_fails_to_launch() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut player = CommandSoundPlayer::new("definitely-not-a-sound-player", Vec::new());
        assert!(matches!(
            player.play(file.path()),
            Err(PlaybackError::Launch { .. })
        ));
        assert!(!player.is_playing());
    }

    #[cfg(unix)]
    #[test]
    fn stop_kills_running_player() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut player = CommandSoundPlayer::new(
            "sh",
            vec!["-c".into(), "sleep 30".into(), "alert".into()],
        );
        player.play(file.path()).unwrap();
        assert!(player.is_playing());
        player.stop();
        assert!(!player.is_playing());
    }
}
