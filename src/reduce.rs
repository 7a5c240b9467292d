// Color Reducer - averages a captured frame down to one RGB sample
use image::RgbaImage;

use crate::types::Rgb;

/// Channel-wise arithmetic mean over every pixel, rounded to nearest.
///
/// Alpha is ignored. An empty frame reduces to black.
pub fn average_color(frame: &RgbaImage) -> Rgb {
    let pixel_count = u64::from(frame.width()) * u64::from(frame.height());
    if pixel_count == 0 {
        return Rgb::default();
    }

    let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
    for px in frame.as_raw().chunks_exact(4) {
        r += u64::from(px[0]);
        g += u64::from(px[1]);
        b += u64::from(px[2]);
    }

    Rgb::new(
        rounded_mean(r, pixel_count),
        rounded_mean(g, pixel_count),
        rounded_mean(b, pixel_count),
    )
}

// Integer round-half-up; the mean of u8 values never exceeds 255
fn rounded_mean(sum: u64, count: u64) -> u8 {
    let mean = (sum + count / 2) / count;
    u8::try_from(mean).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn frame_from(pixels: &[[u8; 4]], width: u32) -> RgbaImage {
        let height = pixels.len() as u32 / width;
        let mut img = RgbaImage::new(width, height);
        for (i, px) in pixels.iter().enumerate() {
            let i = i as u32;
            img.put_pixel(i % width, i / width, Rgba(*px));
        }
        img
    }

    #[test]
    fn red_red_green_blue_reduces_to_rounded_mean() {
        let frame = frame_from(
            &[
                [255, 0, 0, 255],
                [255, 0, 0, 255],
                [0, 255, 0, 255],
                [0, 0, 255, 255],
            ],
            2,
        );
        assert_eq!(average_color(&frame), Rgb::new(128, 64, 64));
    }

    #[test]
    fn alpha_is_ignored() {
        let opaque = frame_from(&[[10, 20, 30, 255], [30, 40, 50, 255]], 2);
        let clear = frame_from(&[[10, 20, 30, 0], [30, 40, 50, 7]], 2);
        assert_eq!(average_color(&opaque), average_color(&clear));
        assert_eq!(average_color(&opaque), Rgb::new(20, 30, 40));
    }

    #[test]
    fn white_frame_stays_in_range() {
        let frame = RgbaImage::from_pixel(64, 48, Rgba([255, 255, 255, 255]));
        assert_eq!(average_color(&frame), Rgb::new(255, 255, 255));
    }

    #[test]
    fn empty_frame_is_black() {
        assert_eq!(average_color(&RgbaImage::new(0, 0)), Rgb::default());
    }

    #[test]
    fn same_frame_same_color() {
        let frame = frame_from(
            &[[1, 2, 3, 4], [200, 100, 50, 25], [9, 99, 199, 0]],
            3,
        );
        assert_eq!(average_color(&frame), average_color(&frame));
        // (1+200+9)/3 = 70, (2+100+99)/3 = 67, (3+50+199)/3 = 84
        assert_eq!(average_color(&frame), Rgb::new(70, 67, 84));
    }
}
