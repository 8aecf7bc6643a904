// crates/rivulet-media/src/helpers/formats.rs
//
// Mapping between the core config enums and the libav pixel/sample
// formats. Lossy in one direction only: unknown libav formats map to
// the Unknown variants.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};

use rivulet_core::{AudioSampleFormat, HwAccelType, ImageFormat};

pub fn pixel_from_image_format(format: ImageFormat) -> Pixel {
    match format {
        ImageFormat::Nv12 => Pixel::NV12,
        ImageFormat::Nv21 => Pixel::NV21,
        ImageFormat::Yuv420p => Pixel::YUV420P,
        ImageFormat::Yuv422p => Pixel::YUV422P,
        ImageFormat::Yuv444p => Pixel::YUV444P,
        ImageFormat::Rgb24 => Pixel::RGB24,
        ImageFormat::Bgr24 => Pixel::BGR24,
        ImageFormat::Rgba => Pixel::RGBA,
        ImageFormat::Bgra => Pixel::BGRA,
        ImageFormat::Dxva2 => Pixel::DXVA2_VLD,
        ImageFormat::D3d11va => Pixel::D3D11,
        ImageFormat::Cuda => Pixel::CUDA,
        ImageFormat::Vaapi => Pixel::VAAPI,
        ImageFormat::Vdpau => Pixel::VDPAU,
        ImageFormat::Qsv => Pixel::QSV,
        ImageFormat::VideoToolbox => Pixel::VIDEOTOOLBOX,
        ImageFormat::Unknown => Pixel::None,
    }
}

pub fn image_format_from_pixel(pixel: Pixel) -> ImageFormat {
    match pixel {
        Pixel::NV12 => ImageFormat::Nv12,
        Pixel::NV21 => ImageFormat::Nv21,
        Pixel::YUV420P | Pixel::YUVJ420P => ImageFormat::Yuv420p,
        Pixel::YUV422P | Pixel::YUVJ422P => ImageFormat::Yuv422p,
        Pixel::YUV444P | Pixel::YUVJ444P => ImageFormat::Yuv444p,
        Pixel::RGB24 => ImageFormat::Rgb24,
        Pixel::BGR24 => ImageFormat::Bgr24,
        Pixel::RGBA => ImageFormat::Rgba,
        Pixel::BGRA => ImageFormat::Bgra,
        Pixel::DXVA2_VLD => ImageFormat::Dxva2,
        Pixel::D3D11 | Pixel::D3D11VA_VLD => ImageFormat::D3d11va,
        Pixel::CUDA => ImageFormat::Cuda,
        Pixel::VAAPI => ImageFormat::Vaapi,
        Pixel::VDPAU => ImageFormat::Vdpau,
        Pixel::QSV => ImageFormat::Qsv,
        Pixel::VIDEOTOOLBOX => ImageFormat::VideoToolbox,
        _ => ImageFormat::Unknown,
    }
}

pub fn audio_format_from_sample(sample: Sample) -> AudioSampleFormat {
    match sample {
        Sample::U8(SampleType::Packed) => AudioSampleFormat::U8,
        Sample::I16(SampleType::Packed) => AudioSampleFormat::S16,
        Sample::I32(SampleType::Packed) => AudioSampleFormat::S32,
        Sample::F32(SampleType::Packed) => AudioSampleFormat::Flt,
        Sample::F64(SampleType::Packed) => AudioSampleFormat::Dbl,
        Sample::U8(SampleType::Planar) => AudioSampleFormat::U8P,
        Sample::I16(SampleType::Planar) => AudioSampleFormat::S16P,
        Sample::I32(SampleType::Planar) => AudioSampleFormat::S32P,
        Sample::F32(SampleType::Planar) => AudioSampleFormat::FltP,
        Sample::F64(SampleType::Planar) => AudioSampleFormat::DblP,
        Sample::I64(SampleType::Packed) => AudioSampleFormat::S64,
        Sample::I64(SampleType::Planar) => AudioSampleFormat::S64P,
        Sample::None => AudioSampleFormat::Unknown,
    }
}

pub fn sample_is_planar(sample: Sample) -> bool {
    matches!(
        sample,
        Sample::U8(SampleType::Planar)
            | Sample::I16(SampleType::Planar)
            | Sample::I32(SampleType::Planar)
            | Sample::I64(SampleType::Planar)
            | Sample::F32(SampleType::Planar)
            | Sample::F64(SampleType::Planar)
    )
}

/// The opposite interleaving of `sample`, used when the decoded layout
/// does not match the configured `audio_interleaved` flag.
pub fn toggled_interleaving(sample: Sample) -> Sample {
    match sample {
        Sample::U8(SampleType::Packed) => Sample::U8(SampleType::Planar),
        Sample::I16(SampleType::Packed) => Sample::I16(SampleType::Planar),
        Sample::I32(SampleType::Packed) => Sample::I32(SampleType::Planar),
        Sample::I64(SampleType::Packed) => Sample::I64(SampleType::Planar),
        Sample::F32(SampleType::Packed) => Sample::F32(SampleType::Planar),
        Sample::F64(SampleType::Packed) => Sample::F64(SampleType::Planar),
        Sample::U8(SampleType::Planar) => Sample::U8(SampleType::Packed),
        Sample::I16(SampleType::Planar) => Sample::I16(SampleType::Packed),
        Sample::I32(SampleType::Planar) => Sample::I32(SampleType::Packed),
        Sample::I64(SampleType::Planar) => Sample::I64(SampleType::Packed),
        Sample::F32(SampleType::Planar) => Sample::F32(SampleType::Packed),
        Sample::F64(SampleType::Planar) => Sample::F64(SampleType::Packed),
        Sample::None => Sample::None,
    }
}

pub fn hw_device_type(accel: HwAccelType) -> Option<ffmpeg::ffi::AVHWDeviceType> {
    use ffmpeg::ffi::AVHWDeviceType::*;
    match accel {
        HwAccelType::None | HwAccelType::Auto => None,
        HwAccelType::Dxva2 => Some(AV_HWDEVICE_TYPE_DXVA2),
        HwAccelType::D3d11va => Some(AV_HWDEVICE_TYPE_D3D11VA),
        HwAccelType::Cuda => Some(AV_HWDEVICE_TYPE_CUDA),
        HwAccelType::Vaapi => Some(AV_HWDEVICE_TYPE_VAAPI),
        HwAccelType::Vdpau => Some(AV_HWDEVICE_TYPE_VDPAU),
        HwAccelType::Qsv => Some(AV_HWDEVICE_TYPE_QSV),
        HwAccelType::VideoToolbox => Some(AV_HWDEVICE_TYPE_VIDEOTOOLBOX),
    }
}

/// The opaque surface format consumers see for each backend.
pub fn hw_image_format(accel: HwAccelType) -> ImageFormat {
    match accel {
        HwAccelType::Dxva2 => ImageFormat::Dxva2,
        HwAccelType::D3d11va => ImageFormat::D3d11va,
        HwAccelType::Cuda => ImageFormat::Cuda,
        HwAccelType::Vaapi => ImageFormat::Vaapi,
        HwAccelType::Vdpau => ImageFormat::Vdpau,
        HwAccelType::Qsv => ImageFormat::Qsv,
        HwAccelType::VideoToolbox => ImageFormat::VideoToolbox,
        HwAccelType::None | HwAccelType::Auto => ImageFormat::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_round_trip_for_software_formats() {
        for format in [
            ImageFormat::Nv12,
            ImageFormat::Nv21,
            ImageFormat::Yuv420p,
            ImageFormat::Yuv422p,
            ImageFormat::Yuv444p,
            ImageFormat::Rgb24,
            ImageFormat::Bgr24,
            ImageFormat::Rgba,
            ImageFormat::Bgra,
        ] {
            assert_eq!(image_format_from_pixel(pixel_from_image_format(format)), format);
        }
    }

    #[test]
    fn sample_mapping_distinguishes_layout() {
        assert_eq!(
            audio_format_from_sample(Sample::I16(SampleType::Packed)),
            AudioSampleFormat::S16
        );
        assert_eq!(
            audio_format_from_sample(Sample::I16(SampleType::Planar)),
            AudioSampleFormat::S16P
        );
        assert_eq!(
            audio_format_from_sample(Sample::F32(SampleType::Planar)),
            AudioSampleFormat::FltP
        );
        assert_eq!(audio_format_from_sample(Sample::None), AudioSampleFormat::Unknown);
    }

    #[test]
    fn interleave_toggle_is_involutive() {
        let fmt = Sample::F32(SampleType::Planar);
        assert_eq!(toggled_interleaving(toggled_interleaving(fmt)), fmt);
        assert_eq!(toggled_interleaving(fmt), Sample::F32(SampleType::Packed));
    }

    #[test]
    fn auto_has_no_device_type() {
        assert!(hw_device_type(HwAccelType::Auto).is_none());
        assert!(hw_device_type(HwAccelType::None).is_none());
        assert!(hw_device_type(HwAccelType::Cuda).is_some());
    }
}
