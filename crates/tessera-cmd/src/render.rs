//! # Render Command Encoding
//!
//! Typed payload of a render submission: one tile-based render pass.
//!
//! Only structure is validated here. Pointers stay opaque GPU addresses
//! until the queue resolves them against its address space bindings.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use tessera_core::{Error, GpuAddr, Result};

/// Attachments per render pass
pub const MAX_ATTACHMENTS: usize = 16;
/// Largest framebuffer dimension in pixels
pub const MAX_FB_DIMENSION: u32 = 16384;
/// Largest layer count
pub const MAX_LAYERS: u32 = 2048;

bitflags! {
    /// Render pass control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RenderFlags: u64 {
        /// Pipeline textures are not cleared between passes
        const NO_CLEAR_PIPELINE_TEXTURES = 1 << 0;
        /// Depth or stencil is reloaded; needs the partial reload stage
        const SET_WHEN_RELOADING_Z_OR_S = 1 << 1;
        /// Memoryless render targets; needs partial reload and store stages
        const MEMORYLESS_RTS_USED = 1 << 2;
        /// Empty tiles run load and store stages
        const PROCESS_EMPTY_TILES = 1 << 3;
    }
}

// =============================================================================
// ATTACHMENTS
// =============================================================================

/// Attachment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AttachmentKind {
    /// Color target
    Color = 0,
    /// Depth target
    Depth = 1,
    /// Stencil target
    Stencil = 2,
}

impl AttachmentKind {
    /// Decode a wire attachment type
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Color),
            1 => Ok(Self::Depth),
            2 => Ok(Self::Stencil),
            _ => Err(Error::InvalidCommand),
        }
    }
}

/// A render target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Kind
    pub kind: AttachmentKind,
    /// Size in bytes
    pub size: u32,
    /// Target address
    pub pointer: GpuAddr,
}

// =============================================================================
// DEPTH / STENCIL PLANES
// =============================================================================

/// One depth or stencil plane
///
/// Index 0 is the primary buffer; 1 and 2 are multisample resolve
/// destinations. A null address leaves that slot unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZsPlane {
    /// Buffers
    pub buffers: [GpuAddr; 3],
    /// Compression metadata buffers
    pub meta: [GpuAddr; 3],
}

impl ZsPlane {
    /// Check if the plane is unused
    pub fn is_unused(&self) -> bool {
        self.buffers.iter().chain(&self.meta).all(|a| a.is_null())
    }
}

// =============================================================================
// PIPELINES
// =============================================================================

/// A tile-boundary program and its binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineBinding {
    /// Program reference
    pub pipeline: u32,
    /// Binding table reference
    pub bind: u32,
}

impl PipelineBinding {
    /// Check if no program is supplied
    pub fn is_null(&self) -> bool {
        self.pipeline == 0
    }
}

/// Programs run at each tile-pass boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pipelines {
    /// Tile load
    pub load: PipelineBinding,
    /// Tile store
    pub store: PipelineBinding,
    /// Reload after a partial render
    pub partial_reload: PipelineBinding,
    /// Store before a partial render
    pub partial_store: PipelineBinding,
}

/// Tile-pass stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Tile load
    Load,
    /// Tile store
    Store,
    /// Partial reload
    PartialReload,
    /// Partial store
    PartialStore,
}

impl Pipelines {
    /// Binding for `stage`
    pub fn get(&self, stage: Stage) -> &PipelineBinding {
        match stage {
            Stage::Load => &self.load,
            Stage::Store => &self.store,
            Stage::PartialReload => &self.partial_reload,
            Stage::PartialStore => &self.partial_store,
        }
    }
}

impl RenderFlags {
    /// Stages that must have a program when these flags are set
    pub fn required_stages(self) -> ArrayVec<Stage, 4> {
        let mut stages: ArrayVec<Stage, 4> = ArrayVec::new();
        let mut need = |stage: Stage| {
            if !stages.contains(&stage) {
                stages.push(stage);
            }
        };
        if self.contains(Self::PROCESS_EMPTY_TILES) {
            need(Stage::Load);
            need(Stage::Store);
        }
        if self.contains(Self::SET_WHEN_RELOADING_Z_OR_S) {
            need(Stage::PartialReload);
        }
        if self.contains(Self::MEMORYLESS_RTS_USED) {
            need(Stage::PartialReload);
            need(Stage::PartialStore);
        }
        stages
    }
}

// =============================================================================
// HARDWARE STATE
// =============================================================================

/// Register values passed through to the command stream unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareState {
    /// ZLS control word
    pub zls_ctrl: u64,
    /// Multisample control
    pub ppp_multisamplectl: u64,
    /// PPP control
    pub ppp_ctrl: u32,
    /// Opaque IOGPU words
    pub iogpu_unk: [u32; 3],
    /// Merge upper bounds (x, y)
    pub merge_upper: (u32, u32),
    /// Packed depth dimensions
    pub depth_dimensions: u32,
    /// Background object depth
    pub isp_bgobjdepth: u32,
    /// Background object values
    pub isp_bgobjvals: u32,
}

// =============================================================================
// RENDER COMMAND
// =============================================================================

/// µtile dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSize {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl TileSize {
    /// Supported µtile shapes
    pub const SUPPORTED: [TileSize; 3] = [
        TileSize { width: 32, height: 32 },
        TileSize { width: 32, height: 16 },
        TileSize { width: 16, height: 16 },
    ];

    /// Check if the hardware supports this shape
    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl Default for TileSize {
    fn default() -> Self {
        Self {
            width: 32,
            height: 32,
        }
    }
}

/// One render pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCommand {
    /// Control flags (unknown bits retained so validation can reject them)
    pub flags: RenderFlags,
    /// Vertex/tiling encoder start
    pub encoder_ptr: GpuAddr,
    /// Depth plane
    pub depth: ZsPlane,
    /// Stencil plane
    pub stencil: ZsPlane,
    /// Scissor array
    pub scissor_array: GpuAddr,
    /// Depth bias array
    pub depth_bias_array: GpuAddr,
    /// Visibility result buffer
    pub visibility_result_buffer: GpuAddr,
    /// Framebuffer width
    pub fb_width: u32,
    /// Framebuffer height
    pub fb_height: u32,
    /// µtile shape
    pub utile: TileSize,
    /// Samples per pixel
    pub samples: u32,
    /// Layer count
    pub layers: u32,
    /// Encoder id
    pub encoder_id: u32,
    /// Tiling (TA) command id
    pub cmd_ta_id: u32,
    /// Fragment (3D) command id
    pub cmd_3d_id: u32,
    /// Tile-boundary programs
    pub pipelines: Pipelines,
    /// Pass-through register values
    pub hw: HardwareState,
    /// Render targets
    pub attachments: ArrayVec<Attachment, MAX_ATTACHMENTS>,
}

impl RenderCommand {
    /// Single-sampled, single-layer pass of `width` x `height`
    pub fn new(encoder_ptr: GpuAddr, width: u32, height: u32) -> Self {
        Self {
            flags: RenderFlags::empty(),
            encoder_ptr,
            depth: ZsPlane::default(),
            stencil: ZsPlane::default(),
            scissor_array: GpuAddr::null(),
            depth_bias_array: GpuAddr::null(),
            visibility_result_buffer: GpuAddr::null(),
            fb_width: width,
            fb_height: height,
            utile: TileSize::default(),
            samples: 1,
            layers: 1,
            encoder_id: 0,
            cmd_ta_id: 0,
            cmd_3d_id: 0,
            pipelines: Pipelines::default(),
            hw: HardwareState::default(),
            attachments: ArrayVec::new(),
        }
    }

    /// Append an attachment
    pub fn push_attachment(&mut self, attachment: Attachment) -> Result<()> {
        self.attachments
            .try_push(attachment)
            .map_err(|_| Error::InvalidCommand)
    }

    /// Structural validation
    pub fn validate(&self) -> Result<()> {
        if !RenderFlags::all().contains(self.flags) {
            log::debug!("render: unknown flags {:#x}", self.flags.bits());
            return Err(Error::InvalidCommand);
        }
        if !(1..=MAX_FB_DIMENSION).contains(&self.fb_width)
            || !(1..=MAX_FB_DIMENSION).contains(&self.fb_height)
        {
            log::debug!(
                "render: framebuffer {}x{} invalid",
                self.fb_width,
                self.fb_height
            );
            return Err(Error::InvalidCommand);
        }
        if !(1..=MAX_LAYERS).contains(&self.layers) {
            log::debug!("render: layer count {} invalid", self.layers);
            return Err(Error::InvalidCommand);
        }
        if !matches!(self.samples, 1 | 2 | 4) {
            log::debug!("render: sample count {} invalid", self.samples);
            return Err(Error::InvalidCommand);
        }
        if !self.utile.is_supported() {
            log::debug!(
                "render: utile {}x{} unsupported",
                self.utile.width,
                self.utile.height
            );
            return Err(Error::InvalidCommand);
        }
        for stage in self.flags.required_stages() {
            if self.pipelines.get(stage).is_null() {
                log::debug!("render: {:?} stage required by flags", stage);
                return Err(Error::InvalidCommand);
            }
        }
        Ok(())
    }

    /// Every non-null address the pass references
    pub fn pointers(&self) -> Vec<GpuAddr> {
        let planes = [&self.depth, &self.stencil]
            .into_iter()
            .flat_map(|p| p.buffers.iter().chain(&p.meta).copied());
        [
            self.encoder_ptr,
            self.scissor_array,
            self.depth_bias_array,
            self.visibility_result_buffer,
        ]
        .into_iter()
        .chain(planes)
        .chain(self.attachments.iter().map(|a| a.pointer))
        .filter(|a| !a.is_null())
        .collect()
    }
}
