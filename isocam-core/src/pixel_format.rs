use std::fmt::{self, Display};

/// 四字符代码 (Four Character Code)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FourCC(pub u32);

impl FourCC {
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self((a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24))
    }

    pub const Y800: Self = Self::new(b'Y', b'8', b'0', b'0');
    pub const Y16: Self = Self::new(b'Y', b'1', b'6', b' ');
    pub const Y411: Self = Self::new(b'Y', b'4', b'1', b'1');
    pub const UYVY: Self = Self::new(b'U', b'Y', b'V', b'Y');
    pub const IYU2: Self = Self::new(b'I', b'Y', b'U', b'2');
    pub const RGB3: Self = Self::new(b'R', b'G', b'B', b'3');
    pub const RGB6: Self = Self::new(b'R', b'G', b'B', b'6');
    pub const BA81: Self = Self::new(b'B', b'A', b'8', b'1');
    pub const BYR2: Self = Self::new(b'B', b'Y', b'R', b'2');
}

impl Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// IIDC 颜色编码 (Format 0-2 固定模式与 Format 7 的 Color Coding ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PixelCoding {
    #[default]
    Mono8,
    Yuv411,
    Yuv422,
    Yuv444,
    Rgb8,
    Mono16,
    Rgb16,
    Raw8,
    Raw16,
}

impl PixelCoding {
    /// 每像素比特数，用于计算帧缓冲区大小
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            Self::Mono8 | Self::Raw8 => 8,
            Self::Yuv411 => 12,
            Self::Yuv422 | Self::Mono16 | Self::Raw16 => 16,
            Self::Yuv444 | Self::Rgb8 => 24,
            Self::Rgb16 => 48,
        }
    }

    /// 16-bit 编码的帧可以按 u16 访问
    pub fn is_wide(&self) -> bool {
        matches!(self, Self::Mono16 | Self::Rgb16 | Self::Raw16)
    }

    pub fn fourcc(&self) -> FourCC {
        match self {
            Self::Mono8 => FourCC::Y800,
            Self::Yuv411 => FourCC::Y411,
            Self::Yuv422 => FourCC::UYVY,
            Self::Yuv444 => FourCC::IYU2,
            Self::Rgb8 => FourCC::RGB3,
            Self::Mono16 => FourCC::Y16,
            Self::Rgb16 => FourCC::RGB6,
            Self::Raw8 => FourCC::BA81,
            Self::Raw16 => FourCC::BYR2,
        }
    }

    /// 一帧图像的字节数
    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        (width as usize * height as usize * self.bits_per_pixel() as usize) / 8
    }
}
