use crate::game::room::{Room, RoomState};
use crate::handlers::HandlerId;
use crate::models::{DialectId, GridSize, InputFrame, ServerEvent, TickFrame};
use crate::pixels::PixelConverter;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Invalid game tick data")]
    InvalidTick,
    #[error("Invalid game input data")]
    InvalidInput,
    #[error("Invalid grid size data")]
    InvalidGridSize,
    #[error("game is not running")]
    NotRunning,
    #[error("not the host")]
    NotHost,
    #[error("not a team member")]
    NotTeamMember,
}

/// Per-tick translation cache: each receiver dialect is computed at most once
/// per tick, however many members share it.
struct TickTranslations<'c> {
    converter: &'c PixelConverter,
    host_dialect: DialectId,
    grids: HashMap<DialectId, Vec<u8>>,
    amounts: HashMap<DialectId, Vec<Vec<u64>>>,
}

impl<'c> TickTranslations<'c> {
    fn grid_for(&mut self, dialect: DialectId, original: &[u8]) -> Vec<u8> {
        self.grids
            .entry(dialect)
            .or_insert_with(|| {
                self.converter
                    .convert_grid(original, self.host_dialect, dialect)
            })
            .clone()
    }

    /// Remap each team's per-pixel counts onto the receiver dialect's
    /// indices. Zero entries are dropped; what remains lands at the
    /// translated index, and the trailing zero run is trimmed.
    fn amounts_for(&mut self, dialect: DialectId, original: &[Vec<u64>]) -> Vec<Vec<u64>> {
        self.amounts
            .entry(dialect)
            .or_insert_with(|| {
                original
                    .iter()
                    .map(|team| {
                        let mut translated = vec![0u64; 256];
                        for (pixel, &count) in team.iter().enumerate() {
                            if count == 0 {
                                continue;
                            }
                            let mapped = self.converter.convert_single(
                                pixel as u8,
                                self.host_dialect,
                                dialect,
                            );
                            translated[mapped as usize] += count;
                        }
                        while translated.last() == Some(&0) {
                            translated.pop();
                        }
                        translated
                    })
                    .collect()
            })
            .clone()
    }
}

/// Validate a host tick and multicast it, translated once per receiver
/// dialect. The host's own dialect passes through untouched.
pub fn relay_tick(
    room: &Room,
    sender: HandlerId,
    frame: &TickFrame,
    converter: &PixelConverter,
) -> Result<(), RelayError> {
    if room.state != RoomState::Running {
        return Err(RelayError::NotRunning);
    }
    if sender != room.host {
        return Err(RelayError::NotHost);
    }
    if frame.team_grid.is_empty() {
        return Err(RelayError::InvalidTick);
    }
    // amount arrays are indexed by pixel id, so they can never be longer
    // than the id space
    if frame
        .data
        .team_pixel_amounts
        .iter()
        .any(|team| team.len() > 256)
    {
        return Err(RelayError::InvalidTick);
    }
    let host_dialect = room
        .member(room.host)
        .map(|m| m.dialect)
        .ok_or(RelayError::NotHost)?;

    let mut cache = TickTranslations {
        converter,
        host_dialect,
        grids: HashMap::new(),
        amounts: HashMap::new(),
    };

    for member in room.members() {
        if member.id == sender {
            continue;
        }
        let event = if member.dialect == host_dialect {
            ServerEvent::Tick(frame.clone())
        } else {
            let mut translated = frame.clone();
            translated.grid = cache.grid_for(member.dialect, &frame.grid);
            translated.data.team_pixel_amounts =
                cache.amounts_for(member.dialect, &frame.data.team_pixel_amounts);
            ServerEvent::Tick(translated)
        };
        let _ = member.sender.send(event);
    }
    Ok(())
}

/// Validate a host `gridSize` and multicast it unchanged.
pub fn relay_grid_size(
    room: &Room,
    sender: HandlerId,
    size: GridSize,
) -> Result<(), RelayError> {
    if room.state != RoomState::Running {
        return Err(RelayError::NotRunning);
    }
    if sender != room.host {
        return Err(RelayError::NotHost);
    }
    if size.width == 0 || size.height == 0 {
        return Err(RelayError::InvalidGridSize);
    }
    for member in room.members() {
        if member.id != sender {
            let _ = member.sender.send(ServerEvent::GridSize(size));
        }
    }
    Ok(())
}

fn translate_input(
    frame: &InputFrame,
    sender_team: u8,
    sender_dialect: DialectId,
    host_dialect: DialectId,
    converter: &PixelConverter,
) -> Result<InputFrame, RelayError> {
    let mut translated = frame.clone();
    translated.team = Some(sender_team);
    match frame.kind {
        // single cell input: six numbers, the last a pixel id or -1
        0 => {
            if frame.data.len() != 6 {
                return Err(RelayError::InvalidInput);
            }
            let pixel = frame.data[5];
            if pixel != -1 {
                let pixel: u8 = pixel.try_into().map_err(|_| RelayError::InvalidInput)?;
                translated.data[5] =
                    converter.convert_single(pixel, sender_dialect, host_dialect) as i64;
            }
        }
        // region paint: one passthrough header, then a packed grid
        1 => {
            if frame.data.is_empty() {
                return Err(RelayError::InvalidInput);
            }
            let bytes: Vec<u8> = frame.data[1..]
                .iter()
                .map(|&v| u8::try_from(v).map_err(|_| RelayError::InvalidInput))
                .collect::<Result<_, _>>()?;
            let converted = converter.convert_grid(&bytes, sender_dialect, host_dialect);
            translated.data.truncate(1);
            translated
                .data
                .extend(converted.into_iter().map(|b| b as i64));
        }
        _ => return Err(RelayError::InvalidInput),
    }
    Ok(translated)
}

fn input_context(room: &Room, sender: HandlerId) -> Result<(u8, DialectId, DialectId), RelayError> {
    if room.state != RoomState::Running {
        return Err(RelayError::NotRunning);
    }
    let team = room.team_of(sender).ok_or(RelayError::NotTeamMember)?;
    let sender_dialect = room
        .member(sender)
        .map(|m| m.dialect)
        .ok_or(RelayError::NotTeamMember)?;
    let host_dialect = room
        .member(room.host)
        .map(|m| m.dialect)
        .ok_or(RelayError::NotTeamMember)?;
    Ok((team, sender_dialect, host_dialect))
}

/// Funnel one input from a team member to the host, rewriting pixel ids into
/// the host's dialect.
pub fn relay_input(
    room: &Room,
    sender: HandlerId,
    frame: &InputFrame,
    converter: &PixelConverter,
) -> Result<(), RelayError> {
    let (team, sender_dialect, host_dialect) = input_context(room, sender)?;
    let translated = translate_input(frame, team, sender_dialect, host_dialect, converter)?;
    if let Some(host) = room.member(room.host) {
        let _ = host.sender.send(ServerEvent::Input(translated));
    }
    Ok(())
}

/// Translate a whole batch and deliver it as one `inputBatch` frame.
pub fn relay_input_batch(
    room: &Room,
    sender: HandlerId,
    frames: &[InputFrame],
    converter: &PixelConverter,
) -> Result<(), RelayError> {
    let (team, sender_dialect, host_dialect) = input_context(room, sender)?;
    let translated = frames
        .iter()
        .map(|frame| translate_input(frame, team, sender_dialect, host_dialect, converter))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(host) = room.member(room.host) {
        let _ = host.sender.send(ServerEvent::InputBatch(translated));
    }
    Ok(())
}
