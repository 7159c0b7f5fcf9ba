//! # 合成器
//!
//! ## 设计思路
//!
//! 把 N 张位图按等高槽位纵向堆叠到白底画布上，每张图在槽位内等比缩放并居中。
//! 几何计算全部是纯函数，可独立测试。
//!
//! ## 实现思路
//!
//! - 画布：宽 `W + 2S`，高 `H·N + M·(N−1) + 2S`
//! - 缩放：`scale = min(W/w, H/h)`，缩放后尺寸向下取整（至少 1 像素）
//! - 居中：槽位内剩余空间整除 2
//! - 绘制：alpha 叠加（`image::imageops::overlay`）

use image::Rgba;
use image::imageops::overlay;

use super::pipeline::resize_bitmap;
use super::{Bitmap, CompositeError, ResizeProfile, SlotLayout};

const CANVAS_BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// 单张位图在画布上的摆放结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Compositor {
    layout: SlotLayout,
    profile: ResizeProfile,
}

impl Compositor {
    pub fn new(layout: SlotLayout, profile: ResizeProfile) -> Self {
        Self { layout, profile }
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    /// `count` 张卡片对应的画布尺寸。
    pub fn canvas_size(&self, count: usize) -> (u32, u32) {
        let SlotLayout {
            slot_width,
            slot_height,
            inner_margin,
            outer_margin,
        } = self.layout;
        let n = count as u32;

        let width = slot_width + outer_margin * 2;
        let height = slot_height * n + inner_margin * n.saturating_sub(1) + outer_margin * 2;
        (width, height)
    }

    /// 第 `index` 个槽位左上角坐标。
    pub fn slot_origin(&self, index: usize) -> (u32, u32) {
        let layout = &self.layout;
        let y = layout.outer_margin + (layout.slot_height + layout.inner_margin) * index as u32;
        (layout.outer_margin, y)
    }

    /// 计算 `width x height` 的位图放入第 `index` 个槽位后的位置与尺寸。
    ///
    /// 零尺寸位图返回 `None`。
    pub fn placement(&self, width: u32, height: u32, index: usize) -> Option<Placement> {
        if width == 0 || height == 0 {
            return None;
        }

        let (slot_w, slot_h) = (self.layout.slot_width as u64, self.layout.slot_height as u64);
        let (w, h) = (width as u64, height as u64);

        // 以整数比较 W/w 与 H/h，避免浮点误差导致贴边一侧少 1 像素
        let (scaled_w, scaled_h) = if slot_w * h <= slot_h * w {
            (slot_w, h * slot_w / w)
        } else {
            (w * slot_h / h, slot_h)
        };
        let scaled_w = scaled_w.clamp(1, slot_w) as u32;
        let scaled_h = scaled_h.clamp(1, slot_h) as u32;

        let (slot_x, slot_y) = self.slot_origin(index);
        Some(Placement {
            x: slot_x + (self.layout.slot_width - scaled_w) / 2,
            y: slot_y + (self.layout.slot_height - scaled_h) / 2,
            width: scaled_w,
            height: scaled_h,
        })
    }

    /// 将位图依次放入槽位，返回完整画布。
    pub fn compose(&self, bitmaps: Vec<Bitmap>) -> Result<Bitmap, CompositeError> {
        if bitmaps.is_empty() {
            return Err(CompositeError::EmptyInput);
        }

        let (canvas_w, canvas_h) = self.canvas_size(bitmaps.len());
        let mut canvas = Bitmap::from_pixel(canvas_w, canvas_h, CANVAS_BACKGROUND);

        log::debug!(
            "🧩 开始合成 - 卡片: {} 画布: {}x{} 档位: {}",
            bitmaps.len(),
            canvas_w,
            canvas_h,
            self.profile.as_str()
        );

        for (index, bitmap) in bitmaps.into_iter().enumerate() {
            let (width, height) = bitmap.dimensions();
            let Some(place) = self.placement(width, height, index) else {
                log::warn!("⚠️ 第 {} 个槽位的位图尺寸为 {}x{}，留空", index, width, height);
                continue;
            };

            let scaled = resize_bitmap(bitmap, place.width, place.height, self.profile);
            overlay(&mut canvas, &scaled, place.x as i64, place.y as i64);
        }

        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn compositor() -> Compositor {
        Compositor::new(SlotLayout::default(), ResizeProfile::Speed)
    }

    #[test]
    fn canvas_size_matches_stacking_formula() {
        let c = compositor();

        assert_eq!(c.canvas_size(1), (1132, 758));
        assert_eq!(c.canvas_size(2), (1132, 1426));
        assert_eq!(c.canvas_size(5), (1132, 638 * 5 + 30 * 4 + 120));
    }

    #[test]
    fn slot_origins_advance_by_slot_plus_margin() {
        let c = compositor();

        assert_eq!(c.slot_origin(0), (60, 60));
        assert_eq!(c.slot_origin(1), (60, 728));
        assert_eq!(c.slot_origin(2), (60, 1396));
    }

    #[test]
    fn slot_shaped_bitmap_fills_slot() {
        let c = compositor();

        assert_eq!(
            c.placement(2024, 1276, 0),
            Some(Placement { x: 60, y: 60, width: 1012, height: 638 })
        );
    }

    #[test]
    fn tall_bitmap_is_height_bound_and_centered() {
        let c = compositor();
        // 850x1100 的页面：scale = 638/1100，宽度 850*638/1100 = 493.0 向下取整
        let place = c.placement(850, 1100, 1).expect("non-empty bitmap");

        assert_eq!(place.height, 638);
        assert_eq!(place.width, 493);
        assert_eq!(place.x, 60 + (1012 - 493) / 2);
        assert_eq!(place.y, 728);
    }

    #[test]
    fn small_bitmap_is_upscaled() {
        let c = compositor();
        let place = c.placement(101, 64, 0).expect("non-empty bitmap");

        assert_eq!(place.width, 1006);
        assert_eq!(place.height, 638);
    }

    #[test]
    fn zero_sized_bitmap_has_no_placement() {
        assert_eq!(compositor().placement(0, 10, 0), None);
        assert_eq!(compositor().placement(10, 0, 0), None);
    }

    #[test]
    fn compose_rejects_empty_input() {
        assert!(matches!(compositor().compose(Vec::new()), Err(CompositeError::EmptyInput)));
    }

    #[test]
    fn compose_draws_each_bitmap_in_its_slot() {
        let red = Bitmap::from_pixel(1012, 638, Rgba([255, 0, 0, 255]));
        let blue = Bitmap::from_pixel(506, 319, Rgba([0, 0, 255, 255]));

        let canvas = compositor().compose(vec![red, blue]).expect("compose should succeed");

        assert_eq!(canvas.dimensions(), (1132, 1426));
        assert_eq!(*canvas.get_pixel(0, 0), CANVAS_BACKGROUND);
        assert_eq!(*canvas.get_pixel(60, 60), Rgba([255, 0, 0, 255]));
        assert_eq!(*canvas.get_pixel(1071, 697), Rgba([255, 0, 0, 255]));
        assert_eq!(*canvas.get_pixel(60, 698), CANVAS_BACKGROUND);
        assert_eq!(*canvas.get_pixel(60, 728), Rgba([0, 0, 255, 255]));
        assert_eq!(*canvas.get_pixel(1131, 1425), CANVAS_BACKGROUND);
    }

    #[test]
    fn transparent_pixels_keep_white_background() {
        let clear = Bitmap::from_pixel(1012, 638, Rgba([0, 0, 0, 0]));
        let canvas = compositor().compose(vec![clear]).expect("compose should succeed");

        assert_eq!(*canvas.get_pixel(500, 300), CANVAS_BACKGROUND);
    }

    #[test]
    fn zero_sized_bitmap_leaves_slot_blank() {
        let canvas = compositor()
            .compose(vec![Bitmap::new(0, 0), Bitmap::from_pixel(10, 10, Rgba([0, 0, 0, 255]))])
            .expect("compose should succeed");

        assert_eq!(canvas.dimensions(), (1132, 1426));
        assert!((60..698).all(|y| *canvas.get_pixel(566, y) == CANVAS_BACKGROUND));
    }

    proptest! {
        #[test]
        fn placement_stays_inside_its_slot(w in 1u32..6000, h in 1u32..6000, index in 0usize..8) {
            let c = compositor();
            let layout = c.layout();
            let (slot_x, slot_y) = c.slot_origin(index);
            let place = c.placement(w, h, index).expect("non-empty bitmap");

            prop_assert!(place.width >= 1 && place.height >= 1);
            prop_assert!(place.x >= slot_x && place.y >= slot_y);
            prop_assert!(place.x + place.width <= slot_x + layout.slot_width);
            prop_assert!(place.y + place.height <= slot_y + layout.slot_height);
            prop_assert!(place.width == layout.slot_width || place.height == layout.slot_height);
        }

        #[test]
        fn canvas_height_grows_linearly(n in 1usize..40) {
            let c = compositor();
            let (w, h) = c.canvas_size(n);
            let step = c.canvas_size(n + 1).1 - h;

            prop_assert_eq!(w, 1132);
            prop_assert_eq!(h, 638 * n as u32 + 30 * (n as u32 - 1) + 120);
            prop_assert_eq!(step, 638 + 30);
        }
    }
}
