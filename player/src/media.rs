//! Local playback surface the sync engine drives.

use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no media loaded")]
    NothingLoaded,
}

/// What the sync engine needs from a playback backend. Real deployments
/// wrap an external player process; tests and the bundled binary run on
/// [`SimPlayer`].
pub trait MediaPlayer {
    fn load(&mut self, media_id: &str, title: &str) -> Result<(), MediaError>;
    fn position_secs(&self) -> Result<f64, MediaError>;
    fn seek(&mut self, position_secs: f64) -> Result<(), MediaError>;
    fn set_rate(&mut self, rate: f64) -> Result<(), MediaError>;
    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self) -> Result<(), MediaError>;
    fn is_playing(&self) -> bool;
    fn rate(&self) -> f64;
    fn loaded_media(&self) -> Option<&str>;
}

/// Wall-clock simulated playback. While playing, the position advances at
/// the applied rate from the last marked point.
pub struct SimPlayer {
    media: Option<(String, String)>,
    playing: bool,
    rate: f64,
    base_position: f64,
    marked_at: Instant,
}

impl SimPlayer {
    pub fn new() -> Self {
        Self {
            media: None,
            playing: false,
            rate: 1.0,
            base_position: 0.0,
            marked_at: Instant::now(),
        }
    }

    fn current_position(&self) -> f64 {
        if self.playing {
            self.base_position + self.marked_at.elapsed().as_secs_f64() * self.rate
        } else {
            self.base_position
        }
    }

    /// Folds elapsed time into the base so a rate or play-state change
    /// starts counting from here.
    fn mark(&mut self) {
        self.base_position = self.current_position();
        self.marked_at = Instant::now();
    }
}

impl Default for SimPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaPlayer for SimPlayer {
    fn load(&mut self, media_id: &str, title: &str) -> Result<(), MediaError> {
        self.media = Some((media_id.to_string(), title.to_string()));
        self.playing = false;
        self.rate = 1.0;
        self.base_position = 0.0;
        self.marked_at = Instant::now();
        Ok(())
    }

    fn position_secs(&self) -> Result<f64, MediaError> {
        if self.media.is_none() {
            return Err(MediaError::NothingLoaded);
        }
        Ok(self.current_position())
    }

    fn seek(&mut self, position_secs: f64) -> Result<(), MediaError> {
        if self.media.is_none() {
            return Err(MediaError::NothingLoaded);
        }
        self.base_position = position_secs.max(0.0);
        self.marked_at = Instant::now();
        Ok(())
    }

    fn set_rate(&mut self, rate: f64) -> Result<(), MediaError> {
        if self.media.is_none() {
            return Err(MediaError::NothingLoaded);
        }
        self.mark();
        self.rate = rate;
        Ok(())
    }

    fn play(&mut self) -> Result<(), MediaError> {
        if self.media.is_none() {
            return Err(MediaError::NothingLoaded);
        }
        if !self.playing {
            self.mark();
            self.playing = true;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), MediaError> {
        if self.media.is_none() {
            return Err(MediaError::NothingLoaded);
        }
        if self.playing {
            self.mark();
            self.playing = false;
        }
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn loaded_media(&self) -> Option<&str> {
        self.media.as_ref().map(|(id, _)| id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn unloaded_player_refuses_commands() {
        let mut player = SimPlayer::new();
        assert!(player.position_secs().is_err());
        assert!(player.play().is_err());
        assert!(player.seek(10.0).is_err());
    }

    #[test]
    fn load_resets_to_a_paused_start() {
        let mut player = SimPlayer::new();
        player.load("abc", "first").expect("load");
        player.seek(30.0).expect("seek");
        player.set_rate(1.05).expect("rate");

        player.load("def", "second").expect("load");
        assert_eq!(0.0, player.position_secs().expect("position"));
        assert_eq!(1.0, player.rate());
        assert!(!player.is_playing());
        assert_eq!(Some("def"), player.loaded_media());
    }

    #[test]
    fn paused_position_is_frozen() {
        let mut player = SimPlayer::new();
        player.load("abc", "t").expect("load");
        player.seek(12.5).expect("seek");

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(12.5, player.position_secs().expect("position"));
    }

    #[test]
    fn playing_position_advances() {
        let mut player = SimPlayer::new();
        player.load("abc", "t").expect("load");
        player.seek(5.0).expect("seek");
        player.play().expect("play");

        std::thread::sleep(Duration::from_millis(30));
        let position = player.position_secs().expect("position");
        assert!(position > 5.0, "position {position} did not advance");
        assert!(position < 6.0, "position {position} ran away");

        player.pause().expect("pause");
        let frozen = player.position_secs().expect("position");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(frozen, player.position_secs().expect("position"));
    }

    #[test]
    fn seek_clamps_negative_targets() {
        let mut player = SimPlayer::new();
        player.load("abc", "t").expect("load");
        player.seek(-3.0).expect("seek");
        assert_eq!(0.0, player.position_secs().expect("position"));
    }
}
