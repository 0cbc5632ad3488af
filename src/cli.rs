// src/cli.rs

//! Line commands read from stdin. Track numbers are 1-based on the command
//! line and 0-based everywhere else.

use crate::fx::{EffectKind, InsertionPoint};
use crate::looper::NUM_TRACKS;

#[derive(Debug, Clone, PartialEq)]
pub enum FxAction {
    Add(EffectKind),
    Remove(u32),
    Up(u32),
    Down(u32),
    Bypass(u32),
    Set { id: u32, param: String, value: f32 },
    List,
}

/// Device changes; `None` goes back to the default.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioAction {
    SampleRate(Option<u32>),
    BufferSize(Option<u32>),
    Input(Option<String>),
    Output(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Press(usize),
    Stop(usize),
    Resume(usize),
    Clear(usize),
    Undo(usize),
    Divider(usize, f64),
    Volume(usize, f32),
    /// `None` derives the pre-roll from the tempo.
    Prerecord(usize, Option<f32>),
    OverdubGain(usize, f32),
    Mute(usize),
    Solo(usize),
    Fx(InsertionPoint, FxAction),
    /// `None` toggles.
    Monitor(Option<bool>),
    MonitorGain(f32),
    Capture { channels: usize, seconds: f32 },
    Audio(AudioAction),
    Calibrate,
    Nudge(f32),
    InputLatency(f32),
    Status,
    Devices,
    Save,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}' (try 'help')")]
    UnknownCommand(String),
    #[error("missing {0}")]
    MissingArgument(&'static str),
    #[error("'{0}' is not a valid number")]
    InvalidNumber(String),
    #[error("'{0}' is not a track number (1-4)")]
    InvalidTrack(String),
    #[error("{0}")]
    UnknownEffect(String),
    #[error("unknown fx action '{0}'")]
    UnknownFxAction(String),
}

pub const HELP: &str = "\
rec N            record / stop recording / overdub / finish overdub on track N
stop N           stop playback, resume, or abort a recording
resume N         resume a stopped loop
clear N          clear track N (track 1 clears everything)
undo N           remove the last overdub
div N X          set the divider of track N
vol N X          set the volume of track N
pre N MS|auto    pre-roll before the overdub boundary
odgain N X       gain applied to new overdub layers
mute N | solo N  toggle mute or solo
fx N add KIND    add pitch|lp|hp|pan|delay|comp to track N
fx N rm|up|down|bypass ID
fx N set ID PARAM VALUE  (delay \"beats\" follows the master tempo)
fx N list
infx ...         same actions on the input chain
mon [on|off]     input monitoring
mongain X        input monitoring gain
capture CH SEC   capture channels (1-2) and seconds per track
audio rate|buffer N|default
audio in|out NAME|default
cal              measure round-trip latency and set the nudge
nudge MS         set the overdub nudge
inlat MS         input latency compensation
status | devices | save | help | quit";

fn next<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    what: &'static str,
) -> Result<&'a str, ParseError> {
    words.next().ok_or(ParseError::MissingArgument(what))
}

fn number<'a, T: std::str::FromStr>(
    words: &mut impl Iterator<Item = &'a str>,
    what: &'static str,
) -> Result<T, ParseError> {
    let word = next(words, what)?;
    word.parse()
        .map_err(|_| ParseError::InvalidNumber(word.to_string()))
}

fn track<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<usize, ParseError> {
    let word = next(words, "track number")?;
    match word.parse::<usize>() {
        Ok(n) if (1..=NUM_TRACKS).contains(&n) => Ok(n - 1),
        _ => Err(ParseError::InvalidTrack(word.to_string())),
    }
}

fn fx_action<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<FxAction, ParseError> {
    let action = next(words, "fx action")?;
    Ok(match action {
        "add" => {
            let kind = next(words, "effect kind")?;
            FxAction::Add(kind.parse().map_err(ParseError::UnknownEffect)?)
        }
        "rm" | "remove" => FxAction::Remove(number(words, "effect id")?),
        "up" => FxAction::Up(number(words, "effect id")?),
        "down" => FxAction::Down(number(words, "effect id")?),
        "bypass" => FxAction::Bypass(number(words, "effect id")?),
        "set" => FxAction::Set {
            id: number(words, "effect id")?,
            param: next(words, "parameter name")?.to_string(),
            value: number(words, "parameter value")?,
        },
        "list" | "ls" => FxAction::List,
        other => return Err(ParseError::UnknownFxAction(other.to_string())),
    })
}

fn audio_action<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<AudioAction, ParseError> {
    let action = next(words, "audio setting")?;
    let rest: Vec<&str> = words.collect();
    let value = match rest.as_slice() {
        [] => return Err(ParseError::MissingArgument("value")),
        ["default"] => None,
        words => Some(words.join(" ")),
    };
    let number = |value: Option<String>| -> Result<Option<u32>, ParseError> {
        match value {
            Some(v) => v.parse().map(Some).map_err(|_| ParseError::InvalidNumber(v)),
            None => Ok(None),
        }
    };
    Ok(match action {
        "rate" => AudioAction::SampleRate(number(value)?),
        "buffer" => AudioAction::BufferSize(number(value)?),
        "in" => AudioAction::Input(value),
        "out" => AudioAction::Output(value),
        other => return Err(ParseError::UnknownCommand(format!("audio {}", other))),
    })
}

pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let head = words.next().ok_or(ParseError::Empty)?;
    let words = &mut words;
    Ok(match head.to_ascii_lowercase().as_str() {
        "rec" | "r" => Command::Press(track(words)?),
        "stop" | "s" => Command::Stop(track(words)?),
        "resume" => Command::Resume(track(words)?),
        "clear" => Command::Clear(track(words)?),
        "undo" | "u" => Command::Undo(track(words)?),
        "div" => {
            let t = track(words)?;
            Command::Divider(t, number(words, "divider")?)
        }
        "vol" => {
            let t = track(words)?;
            Command::Volume(t, number(words, "volume")?)
        }
        "pre" => {
            let t = track(words)?;
            let ms = match next(words, "pre-roll in ms")? {
                "auto" => None,
                word => Some(
                    word.parse()
                        .map_err(|_| ParseError::InvalidNumber(word.to_string()))?,
                ),
            };
            Command::Prerecord(t, ms)
        }
        "odgain" => {
            let t = track(words)?;
            Command::OverdubGain(t, number(words, "gain")?)
        }
        "mute" => Command::Mute(track(words)?),
        "solo" => Command::Solo(track(words)?),
        "fx" => {
            let t = track(words)?;
            Command::Fx(InsertionPoint::Track(t), fx_action(words)?)
        }
        "infx" => Command::Fx(InsertionPoint::Input, fx_action(words)?),
        "mon" => Command::Monitor(match words.next() {
            Some("on") => Some(true),
            Some("off") => Some(false),
            _ => None,
        }),
        "mongain" => Command::MonitorGain(number(words, "gain")?),
        "capture" => {
            let channels = number(words, "channel count")?;
            let word = next(words, "seconds per track")?;
            let seconds = match word.parse::<f32>() {
                Ok(s) if s.is_finite() && s > 0.0 => s,
                _ => return Err(ParseError::InvalidNumber(word.to_string())),
            };
            Command::Capture { channels, seconds }
        }
        "audio" => Command::Audio(audio_action(words)?),
        "cal" => Command::Calibrate,
        "nudge" => Command::Nudge(number(words, "nudge in ms")?),
        "inlat" => Command::InputLatency(number(words, "latency in ms")?),
        "status" | "st" => Command::Status,
        "devices" => Command::Devices,
        "save" => Command::Save,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_numbers_are_one_based() {
        assert_eq!(parse_command("rec 1"), Ok(Command::Press(0)));
        assert_eq!(parse_command("  STOP   4 "), Ok(Command::Stop(3)));
        assert_eq!(
            parse_command("rec 0"),
            Err(ParseError::InvalidTrack("0".into()))
        );
        assert_eq!(
            parse_command("rec 5"),
            Err(ParseError::InvalidTrack("5".into()))
        );
        assert_eq!(
            parse_command("undo"),
            Err(ParseError::MissingArgument("track number"))
        );
    }

    #[test]
    fn test_numeric_arguments() {
        assert_eq!(parse_command("div 2 0.5"), Ok(Command::Divider(1, 0.5)));
        assert_eq!(parse_command("nudge -35"), Ok(Command::Nudge(-35.0)));
        assert_eq!(
            parse_command("vol 3 loud"),
            Err(ParseError::InvalidNumber("loud".into()))
        );
    }

    #[test]
    fn test_fx_actions() {
        assert_eq!(
            parse_command("fx 2 add lp"),
            Ok(Command::Fx(
                InsertionPoint::Track(1),
                FxAction::Add(EffectKind::LowPass)
            ))
        );
        assert_eq!(
            parse_command("infx set 3 cutoff 800"),
            Ok(Command::Fx(
                InsertionPoint::Input,
                FxAction::Set {
                    id: 3,
                    param: "cutoff".into(),
                    value: 800.0
                }
            ))
        );
        assert!(matches!(
            parse_command("fx 1 add wah"),
            Err(ParseError::UnknownEffect(_))
        ));
        assert_eq!(
            parse_command("fx 1 spin 2"),
            Err(ParseError::UnknownFxAction("spin".into()))
        );
    }

    #[test]
    fn test_track_settings() {
        assert_eq!(parse_command("pre 2 auto"), Ok(Command::Prerecord(1, None)));
        assert_eq!(parse_command("pre 2 90"), Ok(Command::Prerecord(1, Some(90.0))));
        assert_eq!(parse_command("odgain 1 0.5"), Ok(Command::OverdubGain(0, 0.5)));
        assert_eq!(
            parse_command("capture 2 30"),
            Ok(Command::Capture {
                channels: 2,
                seconds: 30.0
            })
        );
        assert_eq!(
            parse_command("capture 1 inf"),
            Err(ParseError::InvalidNumber("inf".into()))
        );
        assert_eq!(
            parse_command("capture 1 -3"),
            Err(ParseError::InvalidNumber("-3".into()))
        );
    }

    #[test]
    fn test_audio_actions() {
        assert_eq!(
            parse_command("audio rate 48000"),
            Ok(Command::Audio(AudioAction::SampleRate(Some(48_000))))
        );
        assert_eq!(
            parse_command("audio buffer default"),
            Ok(Command::Audio(AudioAction::BufferSize(None)))
        );
        assert_eq!(
            parse_command("audio in USB Audio CODEC"),
            Ok(Command::Audio(AudioAction::Input(Some(
                "USB Audio CODEC".into()
            ))))
        );
        assert_eq!(
            parse_command("audio rate fast"),
            Err(ParseError::InvalidNumber("fast".into()))
        );
        assert_eq!(
            parse_command("audio out"),
            Err(ParseError::MissingArgument("value"))
        );
    }

    #[test]
    fn test_misc_commands() {
        assert_eq!(parse_command("mon"), Ok(Command::Monitor(None)));
        assert_eq!(parse_command("mon off"), Ok(Command::Monitor(Some(false))));
        assert_eq!(parse_command("q"), Ok(Command::Quit));
        assert_eq!(parse_command(""), Err(ParseError::Empty));
        assert_eq!(
            parse_command("jump"),
            Err(ParseError::UnknownCommand("jump".into()))
        );
    }
}
