//! # Submission Commands
//!
//! The command buffer of a submission is a tagged payload: a render pass, a
//! blit or a compute dispatch.

use tessera_core::{Error, GpuAddr, Result};

use crate::render::RenderCommand;

/// Command type of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    /// Tile-based render pass
    Render = 0,
    /// Blit
    Blit = 1,
    /// Compute dispatch
    Compute = 2,
}

impl CommandType {
    /// Decode a wire command type
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Render),
            1 => Ok(Self::Blit),
            2 => Ok(Self::Compute),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Blit payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlitCommand {
    /// Encoder stream start
    pub encoder_ptr: GpuAddr,
    /// Encoder stream end
    pub encoder_end: GpuAddr,
    /// Encoder id
    pub encoder_id: u32,
    /// Command id
    pub cmd_id: u32,
}

/// Compute payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComputeCommand {
    /// Encoder stream start
    pub encoder_ptr: GpuAddr,
    /// Encoder stream end
    pub encoder_end: GpuAddr,
    /// Buffer descriptor block
    pub buffer_descriptor: GpuAddr,
    /// Buffer descriptor block size
    pub buffer_descriptor_size: u32,
    /// Context switch program
    pub ctx_switch_prog: u32,
    /// Encoder id
    pub encoder_id: u32,
    /// Command id
    pub cmd_id: u32,
}

fn check_encoder(start: GpuAddr, end: GpuAddr) -> Result<()> {
    if start.is_null() || end < start {
        return Err(Error::InvalidCommand);
    }
    Ok(())
}

/// Typed command buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Render pass
    Render(Box<RenderCommand>),
    /// Blit
    Blit(BlitCommand),
    /// Compute dispatch
    Compute(ComputeCommand),
}

impl Command {
    /// Command type tag
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Render(_) => CommandType::Render,
            Self::Blit(_) => CommandType::Blit,
            Self::Compute(_) => CommandType::Compute,
        }
    }

    /// Structural validation
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Render(cmd) => cmd.validate(),
            Self::Blit(cmd) => check_encoder(cmd.encoder_ptr, cmd.encoder_end),
            Self::Compute(cmd) => {
                check_encoder(cmd.encoder_ptr, cmd.encoder_end)?;
                if cmd.buffer_descriptor.is_null() != (cmd.buffer_descriptor_size == 0) {
                    return Err(Error::InvalidCommand);
                }
                Ok(())
            }
        }
    }

    /// Every non-null address the command references
    pub fn pointers(&self) -> Vec<GpuAddr> {
        match self {
            Self::Render(cmd) => cmd.pointers(),
            Self::Blit(cmd) => vec![cmd.encoder_ptr],
            Self::Compute(cmd) => [cmd.encoder_ptr, cmd.buffer_descriptor]
                .into_iter()
                .filter(|a| !a.is_null())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_from_raw() {
        assert_eq!(CommandType::from_raw(2), Ok(CommandType::Compute));
        assert_eq!(CommandType::from_raw(3), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_blit_validation() {
        let mut blit = BlitCommand {
            encoder_ptr: GpuAddr::new(0x20_0000_0000),
            encoder_end: GpuAddr::new(0x20_0000_0100),
            ..Default::default()
        };
        assert_eq!(Command::Blit(blit).validate(), Ok(()));
        blit.encoder_end = GpuAddr::new(0x1000);
        assert_eq!(Command::Blit(blit).validate(), Err(Error::InvalidCommand));
    }

    #[test]
    fn test_compute_descriptor_pairing() {
        let mut compute = ComputeCommand {
            encoder_ptr: GpuAddr::new(0x20_0000_0000),
            encoder_end: GpuAddr::new(0x20_0000_0040),
            ..Default::default()
        };
        let cmd = Command::Compute(compute);
        assert_eq!(cmd.validate(), Ok(()));
        assert_eq!(cmd.pointers().len(), 1);

        compute.buffer_descriptor = GpuAddr::new(0x20_0000_4000);
        assert_eq!(
            Command::Compute(compute).validate(),
            Err(Error::InvalidCommand)
        );
        compute.buffer_descriptor_size = 0x40;
        assert_eq!(Command::Compute(compute).validate(), Ok(()));
        assert_eq!(Command::Compute(compute).pointers().len(), 2);
    }
}
