use std::io::Cursor;

use anyhow::{anyhow, bail, ensure, Result};
use ddsfile::{D3DFormat, Dds, DxgiFormat, NewD3dParams};
use image::{imageops, ImageBuffer, Pixel, Rgba, RgbaImage};

use crate::format::mtrl::Texture;

const BC1_BLOCK_SIZE: usize = 8;
const BC2_BLOCK_SIZE: usize = 16;
const BC3_BLOCK_SIZE: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SurfaceFormat {
    Bc1,
    Bc2,
    Bc3,
    Bgra8,
    Rgba8,
}

fn surface_format(dds: &Dds) -> Option<SurfaceFormat> {
    if let Some(format) = dds.get_d3d_format() {
        return match format {
            D3DFormat::DXT1 => Some(SurfaceFormat::Bc1),
            D3DFormat::DXT2 | D3DFormat::DXT3 => Some(SurfaceFormat::Bc2),
            D3DFormat::DXT4 | D3DFormat::DXT5 => Some(SurfaceFormat::Bc3),
            D3DFormat::A8R8G8B8 => Some(SurfaceFormat::Bgra8),
            D3DFormat::A8B8G8R8 => Some(SurfaceFormat::Rgba8),
            _ => None,
        };
    }
    match dds.get_dxgi_format()? {
        DxgiFormat::BC1_UNorm | DxgiFormat::BC1_UNorm_sRGB => Some(SurfaceFormat::Bc1),
        DxgiFormat::BC2_UNorm | DxgiFormat::BC2_UNorm_sRGB => Some(SurfaceFormat::Bc2),
        DxgiFormat::BC3_UNorm | DxgiFormat::BC3_UNorm_sRGB => Some(SurfaceFormat::Bc3),
        DxgiFormat::B8G8R8A8_UNorm | DxgiFormat::B8G8R8A8_UNorm_sRGB => Some(SurfaceFormat::Bgra8),
        DxgiFormat::R8G8B8A8_UNorm | DxgiFormat::R8G8B8A8_UNorm_sRGB => Some(SurfaceFormat::Rgba8),
        _ => None,
    }
}

/// Decodes the top mip level of a DDS image to RGBA.
pub fn decode_dds(data: &[u8]) -> Result<RgbaImage> {
    let dds = Dds::read(&mut Cursor::new(data))?;
    let (w, h) = (dds.get_width(), dds.get_height());
    ensure!(w > 0 && h > 0, "Empty DDS surface");
    let Some(format) = surface_format(&dds) else {
        bail!(
            "Unsupported DDS format (D3D {:?}, DXGI {:?})",
            dds.get_d3d_format(),
            dds.get_dxgi_format()
        );
    };
    let blocks = |block_size: usize| (((w + 3) / 4) * ((h + 3) / 4)) as usize * block_size;
    let size = match format {
        SurfaceFormat::Bc1 => blocks(BC1_BLOCK_SIZE),
        SurfaceFormat::Bc2 => blocks(BC2_BLOCK_SIZE),
        SurfaceFormat::Bc3 => blocks(BC3_BLOCK_SIZE),
        SurfaceFormat::Bgra8 | SurfaceFormat::Rgba8 => (w * h * 4) as usize,
    };
    ensure!(
        dds.data.len() >= size,
        "DDS data too small: {:#X} < {:#X} for {:?} {}x{}",
        dds.data.len(),
        size,
        format,
        w,
        h
    );
    let data = &dds.data[..size];
    Ok(match format {
        SurfaceFormat::Bc1 => {
            decompress_bcn::<Rgba<u8>, _, BC1_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                bcdec_rs::bc1(src, dst, pitch)
            })?
        }
        SurfaceFormat::Bc2 => {
            decompress_bcn::<Rgba<u8>, _, BC2_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                bcdec_rs::bc2(src, dst, pitch)
            })?
        }
        SurfaceFormat::Bc3 => {
            decompress_bcn::<Rgba<u8>, _, BC3_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                bcdec_rs::bc3(src, dst, pitch)
            })?
        }
        SurfaceFormat::Rgba8 => RgbaImage::from_raw(w, h, data.to_vec())
            .ok_or_else(|| anyhow!("Conversion failed: {}x{} from size {}", w, h, data.len()))?,
        SurfaceFormat::Bgra8 => {
            let mut rgba = data.to_vec();
            for px in rgba.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            RgbaImage::from_raw(w, h, rgba)
                .ok_or_else(|| anyhow!("Conversion failed: {}x{} from size {}", w, h, data.len()))?
        }
    })
}

/// Encodes an image as an uncompressed A8R8G8B8 DDS without mips.
pub fn encode_dds(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut dds = Dds::new_d3d(NewD3dParams {
        height: image.height(),
        width: image.width(),
        depth: None,
        format: D3DFormat::A8R8G8B8,
        mipmap_levels: None,
        caps2: None,
    })?;
    let mut bgra = image.as_raw().clone();
    for px in bgra.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    dds.data = bgra;
    let mut out = Vec::new();
    dds.write(&mut out)?;
    Ok(out)
}

/// New opaque image whose color planes are the alpha plane of `image`.
pub fn alpha_to_color(image: &RgbaImage) -> RgbaImage {
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let a = image.get_pixel(x, y).0[3];
        Rgba([a, a, a, u8::MAX])
    })
}

/// Copy of `image` with its alpha plane replaced by the red plane of `mask`.
pub fn red_to_alpha(image: &RgbaImage, mask: &RgbaImage) -> Result<RgbaImage> {
    ensure!(
        image.dimensions() == mask.dimensions(),
        "Mask size {}x{} does not match image size {}x{}",
        mask.width(),
        mask.height(),
        image.width(),
        image.height()
    );
    let mut out = image.clone();
    for (px, m) in out.pixels_mut().zip(mask.pixels()) {
        px.0[3] = m.0[0];
    }
    Ok(out)
}

/// Wraps a synthesized image as a texture. Identity is the CRC-32 of the encoded bytes.
pub fn texture_from_image(template: &Texture, image: &RgbaImage) -> Result<Texture> {
    let data = encode_dds(image)?;
    let hash = crc32fast::hash(&data);
    Ok(Texture {
        uid: hash,
        hash,
        kind: template.kind,
        flags: template.flags,
        width: u16::try_from(image.width())?,
        height: u16::try_from(image.height())?,
        data,
    })
}

fn decompress_bcn<P, F, const BLOCK_SIZE: usize>(
    data: &[u8],
    w: u32,
    h: u32,
    func: F,
) -> Result<ImageBuffer<P, Vec<P::Subpixel>>>
where
    P: Pixel + 'static,
    F: Fn(&[u8], &mut [P::Subpixel], usize),
{
    // Decode into a surface padded to whole blocks
    let bw = (w + 3) / 4 * 4;
    let bh = (h + 3) / 4 * 4;
    ensure!(data.len() == ((bw / 4) * (bh / 4)) as usize * BLOCK_SIZE);
    let mut image = ImageBuffer::<P, Vec<P::Subpixel>>::new(bw, bh);
    let buffer = image.as_flat_samples_mut();
    let mut src = data;
    for i in (0..bh as usize).step_by(4) {
        for j in (0..bw as usize).step_by(4) {
            let start = i * buffer.layout.height_stride + j * buffer.layout.width_stride;
            let dst = &mut buffer.samples[start..];
            func(&src[..BLOCK_SIZE], dst, buffer.layout.height_stride);
            src = &src[BLOCK_SIZE..];
        }
    }
    if (bw, bh) != (w, h) {
        image = imageops::crop_imm(&image, 0, 0, w, h).to_image();
    }
    Ok(image)
}
