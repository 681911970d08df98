use fixedbitset::FixedBitSet;

/// Dense binary image mask.
///
/// Pixels are stored row-major in a [`FixedBitSet`]. Used for detection
/// segmentations, rendered model silhouettes and depth validity.
#[derive(Debug, Clone)]
pub struct Mask {
    width: usize,
    height: usize,
    bits: FixedBitSet,
}

impl Mask {
    /// Returns an empty mask of the given dimensions.
    pub fn new(width: usize, height: usize) -> Mask {
        Mask {
            width,
            height,
            bits: FixedBitSet::with_capacity(width * height),
        }
    }

    /// Returns a mask built by evaluating `f` at every `(x, y)` pixel.
    pub fn from_fn<F: FnMut(usize, usize) -> bool>(width: usize, height: usize, mut f: F) -> Mask {
        let mut mask = Mask::new(width, height);
        for y in 0..height {
            for x in 0..width {
                if f(x, y) {
                    mask.bits.insert(y * width + x);
                }
            }
        }
        mask
    }

    /// Returns the mask width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns the mask height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Sets the pixel at `(x, y)`.
    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        self.bits.set(y * self.width + x, value);
    }

    /// Returns true if the pixel at `(x, y)` is set.
    pub fn contains(&self, x: usize, y: usize) -> bool {
        self.bits.contains(y * self.width + x)
    }

    /// Returns the number of set pixels.
    pub fn count(&self) -> usize {
        self.bits.count_ones(..)
    }

    /// Returns true if no pixel is set.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Returns an iterator over the `(x, y)` coordinates of set pixels in
    /// row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let width = self.width;
        self.bits.ones().map(move |i| (i % width, i / width))
    }

    /// Clears every pixel.
    pub fn clear(&mut self) {
        self.bits.clear();
    }

    /// Intersection over union with another mask of the same dimensions, in
    /// `[0.0, 1.0]`. Two empty masks have an IOU of `0.0`.
    pub fn iou(&self, other: &Mask) -> f32 {
        debug_assert_eq!(self.width, other.width);
        debug_assert_eq!(self.height, other.height);

        let mut intersection = self.bits.clone();
        intersection.intersect_with(&other.bits);
        let mut union = self.bits.clone();
        union.union_with(&other.bits);

        let union_count = union.count_ones(..);
        if union_count == 0 {
            return 0.0;
        }
        intersection.count_ones(..) as f32 / union_count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn rect_mask(width: usize, height: usize, x0: usize, y0: usize, w: usize, h: usize) -> Mask {
        Mask::from_fn(width, height, |x, y| {
            x >= x0 && x < x0 + w && y >= y0 && y < y0 + h
        })
    }

    #[test]
    fn count_and_contains() {
        let mask = rect_mask(16, 16, 2, 3, 4, 5);
        assert_eq!(mask.count(), 20);
        assert!(mask.contains(2, 3));
        assert!(mask.contains(5, 7));
        assert!(!mask.contains(6, 3));
        assert!(!mask.contains(2, 8));
    }

    #[test]
    fn iou_identical() {
        let a = rect_mask(16, 16, 0, 0, 8, 8);
        assert_approx_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn iou_disjoint() {
        let a = rect_mask(16, 16, 0, 0, 4, 4);
        let b = rect_mask(16, 16, 8, 8, 4, 4);
        assert_approx_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_partial_overlap() {
        // 8x8 boxes offset by 4 pixels: intersection 32, union 96.
        let a = rect_mask(16, 16, 0, 0, 8, 8);
        let b = rect_mask(16, 16, 4, 0, 8, 8);
        assert_approx_eq!(a.iou(&b), 32.0 / 96.0);
        assert_approx_eq!(b.iou(&a), a.iou(&b));
    }

    #[test]
    fn iou_empty_masks() {
        let a = Mask::new(8, 8);
        let b = Mask::new(8, 8);
        assert_approx_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn pixels_iterates_set_coordinates() {
        let mask = rect_mask(4, 4, 1, 1, 2, 1);
        let pixels: Vec<(usize, usize)> = mask.pixels().collect();
        assert_eq!(pixels, vec![(1, 1), (2, 1)]);
    }
}
