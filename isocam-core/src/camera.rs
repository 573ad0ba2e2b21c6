use std::collections::BTreeSet;

use crate::error::{CameraError, Result};
use crate::pixel_format::PixelCoding;

/// IIDC 中 Format 7 (Partial Scan) 的格式编号
pub const FORMAT_7: u8 = 7;

/// 1394 总线速率
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum BusSpeed {
    S100,
    S200,
    S400,
}

impl BusSpeed {
    /// 该速率下单个等时包的最大负载 (字节)
    pub fn max_isoch_payload(&self) -> usize {
        match self {
            Self::S100 => 1024,
            Self::S200 => 2048,
            Self::S400 => 4096,
        }
    }

    pub fn mbps(&self) -> u32 {
        match self {
            Self::S100 => 100,
            Self::S200 => 200,
            Self::S400 => 400,
        }
    }
}

/// 当前视频模式推导出的传输参数
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoSettings {
    pub format: u8,
    pub mode: u8,
    pub frame_rate: u8,
    pub width: u32,
    pub height: u32,
    pub coding: PixelCoding,
    /// 每个等时包的字节数 (带宽申请依据)
    pub max_bytes_per_packet: usize,
    /// 一帧的最大字节数 (每个 Buffer 的大小)
    pub max_buffer_size: usize,
}

impl VideoSettings {
    /// Format 0-2 的固定模式：包大小来自 quadlets-per-packet 表
    pub fn fixed(
        (format, mode, frame_rate): (u8, u8, u8),
        width: u32,
        height: u32,
        coding: PixelCoding,
        quadlets_per_packet: usize,
    ) -> Self {
        Self {
            format,
            mode,
            frame_rate,
            width,
            height,
            coding,
            max_bytes_per_packet: 4 * quadlets_per_packet,
            max_buffer_size: coding.frame_bytes(width, height),
        }
    }

    /// Format 7：包大小与每帧包数由相机协商得到
    pub fn format7(
        mode: u8,
        width: u32,
        height: u32,
        coding: PixelCoding,
        bytes_per_packet: usize,
        packets_per_frame: usize,
    ) -> Self {
        Self {
            format: FORMAT_7,
            mode,
            frame_rate: 0,
            width,
            height,
            coding,
            max_bytes_per_packet: bytes_per_packet,
            max_buffer_size: bytes_per_packet * packets_per_frame,
        }
    }

    pub fn key(&self) -> (u8, u8, u8) {
        (self.format, self.mode, self.frame_rate)
    }
}

/// 相机协作方的状态快照
///
/// 寄存器读写与特性控制不在本库范围内；调用方负责在初始化相机之后
/// 填写这些字段 (支持的模式、当前模式、链路速率)。
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CameraProfile {
    /// 设备唯一 ID (用于 Driver::open_stream)
    pub device_id: String,
    pub initialized: bool,
    pub speed: BusSpeed,
    pub video: VideoSettings,
    /// 相机声明支持的 (format, mode, rate) 组合
    pub supported_modes: BTreeSet<(u8, u8, u8)>,
    pub format7_available: bool,
}

impl CameraProfile {
    /// 以当前模式为唯一支持模式构建一个已初始化的 Profile
    pub fn new(device_id: impl Into<String>, speed: BusSpeed, video: VideoSettings) -> Self {
        let mut supported_modes = BTreeSet::new();
        let format7_available = video.format == FORMAT_7;
        if !format7_available {
            supported_modes.insert(video.key());
        }
        Self {
            device_id: device_id.into(),
            initialized: true,
            speed,
            video,
            supported_modes,
            format7_available,
        }
    }

    /// start() 的前置检查：相机已初始化，且当前视频模式受支持
    pub fn validate(&self) -> Result<()> {
        if !self.initialized {
            return Err(CameraError::NotInitialized("initialize the camera first"));
        }

        let supported = if self.video.format == FORMAT_7 {
            self.format7_available
        } else {
            self.supported_modes.contains(&self.video.key())
        };

        if !supported {
            let (format, mode, rate) = self.video.key();
            return Err(CameraError::InvalidVideoSettings { format, mode, rate });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vga_yuv422() -> VideoSettings {
        // Format 0, Mode 3, 15fps: 640x480 YUV422, 320 quadlets/packet
        VideoSettings::fixed((0, 3, 3), 640, 480, PixelCoding::Yuv422, 320)
    }

    #[test]
    fn fixed_mode_derives_packet_and_buffer_size() {
        let v = vga_yuv422();
        assert_eq!(v.max_bytes_per_packet, 1280);
        assert_eq!(v.max_buffer_size, 614_400);
    }

    #[test]
    fn format7_buffer_is_packets_times_bytes() {
        let v = VideoSettings::format7(0, 1024, 768, PixelCoding::Mono8, 4096, 192);
        assert_eq!(v.max_buffer_size, 786_432);
        assert_eq!(v.format, FORMAT_7);
    }

    #[test]
    fn validate_reports_each_precondition() {
        let mut cam = CameraProfile::new("cam0", BusSpeed::S400, vga_yuv422());
        assert!(cam.validate().is_ok());

        cam.video.frame_rate = 5;
        assert!(matches!(
            cam.validate(),
            Err(CameraError::InvalidVideoSettings {
                format: 0,
                mode: 3,
                rate: 5
            })
        ));

        cam.initialized = false;
        assert!(matches!(
            cam.validate(),
            Err(CameraError::NotInitialized(_))
        ));
    }
}
