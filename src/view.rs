//! Composable logical-to-physical index algebra.
//!
//! A [`ShapeTracker`] maps a logical multi-index into a `(physical_offset,
//! valid)` pair over a hypothetical contiguous buffer, as a stack of affine
//! [`View`]s with optional per-axis masks. All operations return a new
//! tracker; nothing mutates.

use crate::alu::AluExp;
use crate::error::{Error, Result};
use crate::utils::{apply_permutation, is_permutation};
use crate::DType;

/// One affine view: shape, strides, offset, and an optional per-axis valid
/// range `[lo, hi)`. A `None` mask means every in-range index is valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct View {
    shape: Vec<usize>,
    strides: Vec<isize>,
    offset: isize,
    mask: Option<Vec<(usize, usize)>>,
}

impl View {
    /// Row-major contiguous view of `shape`. Strides of unit axes are
    /// canonicalized to 0.
    pub fn contiguous(shape: &[usize]) -> View {
        let mut strides = vec![1isize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1] as isize;
        }
        for (st, &n) in strides.iter_mut().zip(shape.iter()) {
            if n == 1 {
                *st = 0;
            }
        }
        View { shape: shape.to_vec(), strides, offset: 0, mask: None }
    }

    fn size(&self) -> usize {
        self.shape.iter().product()
    }

    fn is_contiguous(&self) -> bool {
        self.mask.is_none()
            && self.offset == 0
            && self.strides == View::contiguous(&self.shape).strides
    }

    /// The mask with defaults filled in: `[0, n)` per axis.
    fn full_mask(&self) -> Vec<(usize, usize)> {
        match &self.mask {
            Some(m) => m.clone(),
            None => self.shape.iter().map(|&n| (0, n)).collect(),
        }
    }

    fn set_mask(mut self, mask: Vec<(usize, usize)>) -> View {
        let trivial = mask.iter().zip(self.shape.iter()).all(|(&(lo, hi), &n)| lo == 0 && hi == n);
        self.mask = if trivial { None } else { Some(mask) };
        self
    }

    fn permute(&self, axes: &[usize]) -> View {
        View {
            shape: apply_permutation(&self.shape, axes),
            strides: apply_permutation(&self.strides, axes),
            offset: self.offset,
            mask: self.mask.as_ref().map(|m| apply_permutation(m, axes)),
        }
    }

    fn expand(&self, target: &[usize]) -> Result<View> {
        let mut shape = Vec::with_capacity(target.len());
        let mut strides = Vec::with_capacity(target.len());
        let mut mask = Vec::with_capacity(target.len());
        let old_mask = self.full_mask();
        for (k, (&n, &t)) in self.shape.iter().zip(target.iter()).enumerate() {
            if n == t {
                shape.push(n);
                strides.push(self.strides[k]);
                mask.push(old_mask[k]);
            } else if n == 1 {
                shape.push(t);
                strides.push(0);
                // A fully valid unit axis broadcasts to a fully valid axis;
                // an empty one stays empty.
                mask.push(if old_mask[k] == (0, 1) { (0, t) } else { (0, 0) });
            } else {
                return Err(Error::Type(format!(
                    "cannot expand axis {} from {} to {}",
                    k, n, t
                )));
            }
        }
        Ok(View { shape, strides, offset: self.offset, mask: None }.set_mask(mask))
    }

    fn pad(&self, widths: &[(usize, usize)]) -> View {
        let old_mask = self.full_mask();
        let mut shape = Vec::with_capacity(self.shape.len());
        let mut mask = Vec::with_capacity(self.shape.len());
        let mut offset = self.offset;
        for (k, &(l, r)) in widths.iter().enumerate() {
            shape.push(self.shape[k] + l + r);
            mask.push((old_mask[k].0 + l, old_mask[k].1 + l));
            offset -= l as isize * self.strides[k];
        }
        View { shape, strides: self.strides.clone(), offset, mask: None }.set_mask(mask)
    }

    fn shrink(&self, ranges: &[(usize, usize)]) -> View {
        let old_mask = self.full_mask();
        let mut shape = Vec::with_capacity(self.shape.len());
        let mut mask = Vec::with_capacity(self.shape.len());
        let mut offset = self.offset;
        for (k, &(lo, hi)) in ranges.iter().enumerate() {
            shape.push(hi - lo);
            let m_lo = old_mask[k].0.max(lo).saturating_sub(lo);
            let m_hi = old_mask[k].1.min(hi).saturating_sub(lo);
            mask.push((m_lo, m_hi.max(m_lo)));
            offset += lo as isize * self.strides[k];
        }
        View { shape, strides: self.strides.clone(), offset, mask: None }.set_mask(mask)
    }

    fn flip(&self, axes: &[bool]) -> View {
        let old_mask = self.full_mask();
        let mut strides = self.strides.clone();
        let mut mask = Vec::with_capacity(self.shape.len());
        let mut offset = self.offset;
        for (k, &do_flip) in axes.iter().enumerate() {
            let n = self.shape[k];
            if do_flip && n > 0 {
                offset += (n as isize - 1) * strides[k];
                strides[k] = -strides[k];
                mask.push((n - old_mask[k].1, n - old_mask[k].0));
            } else {
                mask.push(old_mask[k]);
            }
        }
        View { shape: self.shape.clone(), strides, offset, mask: None }.set_mask(mask)
    }

    /// Try to reinterpret this view under `new_shape` without composing a new
    /// view. Succeeds when the view is contiguous, or when the reshape only
    /// inserts/removes unit axes.
    fn reshape(&self, new_shape: &[usize]) -> Option<View> {
        if new_shape == self.shape.as_slice() {
            return Some(self.clone());
        }
        if self.mask.is_none() && self.is_contiguous() {
            return Some(View::contiguous(new_shape));
        }
        // Unit-axis insertion/removal: the non-unit dims must agree in order.
        let old_core: Vec<usize> =
            self.shape.iter().copied().filter(|&n| n != 1).collect();
        let new_core: Vec<usize> = new_shape.iter().copied().filter(|&n| n != 1).collect();
        if old_core != new_core {
            return None;
        }
        let old_mask = self.full_mask();
        // Dropped unit axes must be fully valid, else validity cannot be
        // expressed on the remaining axes.
        let mut core = Vec::new();
        for (k, &n) in self.shape.iter().enumerate() {
            if n != 1 {
                core.push((self.strides[k], old_mask[k]));
            } else if old_mask[k] != (0, 1) {
                return None;
            }
        }
        let mut strides = Vec::with_capacity(new_shape.len());
        let mut mask = Vec::with_capacity(new_shape.len());
        let mut it = core.into_iter();
        for &n in new_shape {
            if n == 1 {
                strides.push(0);
                mask.push((0, 1));
            } else {
                let (st, m) = it.next()?;
                strides.push(st);
                mask.push(m);
            }
        }
        Some(
            View { shape: new_shape.to_vec(), strides, offset: self.offset, mask: None }
                .set_mask(mask),
        )
    }

    /// Flat offset and validity for one logical index of this view.
    fn locate(&self, idx: &[i64]) -> (i64, bool) {
        let mut offset = self.offset as i64;
        let mut valid = true;
        let mask = self.full_mask();
        for (k, &i) in idx.iter().enumerate() {
            offset += i * self.strides[k] as i64;
            valid &= (mask[k].0 as i64) <= i && i < mask[k].1 as i64;
        }
        (offset, valid)
    }

    /// Symbolic form of [`View::locate`].
    fn to_alu(&self, idx: &[AluExp]) -> Result<(AluExp, AluExp)> {
        let mut offset = AluExp::int(self.offset as i64);
        let mut valid = AluExp::constant(crate::Scalar::Bool(true));
        let mask = self.full_mask();
        for (k, i) in idx.iter().enumerate() {
            if self.strides[k] != 0 {
                let term = AluExp::mul(i.clone(), AluExp::int(self.strides[k] as i64))?;
                offset = AluExp::add(offset, term)?;
            }
            let (lo, hi) = mask[k];
            if (lo, hi) != (0, self.shape[k]) {
                // lo <= i  encoded as  lo - 1 < i
                let ge = AluExp::cmplt(AluExp::int(lo as i64 - 1), i.clone())?;
                let lt = AluExp::cmplt(i.clone(), AluExp::int(hi as i64))?;
                valid = AluExp::and(valid, AluExp::and(ge, lt)?)?;
            }
        }
        Ok((offset, valid))
    }
}

/// Decompose a flat int32 index in `[0, product(shape))` into per-axis
/// symbolic indices, with successive `Idiv`/`Mod` on a right-to-left stride
/// schedule.
pub fn unravel_alu(shape: &[usize], flat: &AluExp) -> Result<Vec<AluExp>> {
    let mut out = vec![AluExp::int(0); shape.len()];
    let mut stride = 1i64;
    for k in (0..shape.len()).rev() {
        let q = AluExp::idiv(flat.clone(), AluExp::int(stride))?;
        out[k] = AluExp::modulo(q, AluExp::int(shape[k] as i64))?;
        stride *= shape[k] as i64;
    }
    Ok(out)
}

/// A nonempty stack of views. The last view is the logical surface; the
/// first maps into the physical buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeTracker {
    views: Vec<View>,
}

impl ShapeTracker {
    /// Tracker over a fresh contiguous buffer of `shape`.
    pub fn contiguous(shape: &[usize]) -> ShapeTracker {
        ShapeTracker { views: vec![View::contiguous(shape)] }
    }

    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.views.last().expect("tracker has at least one view").shape
    }

    /// Number of logical dimensions.
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Number of logical elements.
    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if the tracker is a plain row-major identity map.
    pub fn is_contiguous(&self) -> bool {
        self.views.len() == 1 && self.views[0].is_contiguous()
    }

    fn with_last(&self, view: View) -> ShapeTracker {
        let mut views = self.views.clone();
        *views.last_mut().expect("tracker has at least one view") = view;
        ShapeTracker { views }
    }

    /// Reinterpret the logical shape. Merges into the top view when the view
    /// algebra allows it, otherwise pushes a new view.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<ShapeTracker> {
        let new_size: usize = new_shape.iter().product();
        if new_size != self.size() {
            return Err(Error::Type(format!(
                "cannot reshape {:?} (size {}) to {:?}",
                self.shape(),
                self.size(),
                new_shape
            )));
        }
        let last = self.views.last().expect("tracker has at least one view");
        if let Some(view) = last.reshape(new_shape) {
            return Ok(self.with_last(view));
        }
        let mut views = self.views.clone();
        views.push(View::contiguous(new_shape));
        Ok(ShapeTracker { views })
    }

    /// Permute the logical axes.
    pub fn permute(&self, axes: &[usize]) -> Result<ShapeTracker> {
        if axes.len() != self.ndim() || !is_permutation(axes) {
            return Err(Error::Type(format!(
                "invalid permutation {:?} for rank {}",
                axes,
                self.ndim()
            )));
        }
        let last = self.views.last().expect("tracker has at least one view");
        Ok(self.with_last(last.permute(axes)))
    }

    /// Insert unit axes at `added_axes` (positions in the result), then
    /// expand every unit axis to the target `shape` with stride 0.
    pub fn broadcast(&self, shape: &[usize], added_axes: &[usize]) -> Result<ShapeTracker> {
        let mut with_units = Vec::with_capacity(shape.len());
        let mut src = self.shape().iter();
        for k in 0..shape.len() {
            if added_axes.contains(&k) {
                with_units.push(1);
            } else {
                with_units.push(*src.next().ok_or_else(|| {
                    Error::Type(format!(
                        "broadcast of {:?} to {:?} adding {:?}: rank mismatch",
                        self.shape(),
                        shape,
                        added_axes
                    ))
                })?);
            }
        }
        if src.next().is_some() {
            return Err(Error::Type(format!(
                "broadcast of {:?} to {:?} adding {:?}: rank mismatch",
                self.shape(),
                shape,
                added_axes
            )));
        }
        let reshaped = self.reshape(&with_units)?;
        let last = reshaped.views.last().expect("tracker has at least one view");
        Ok(reshaped.with_last(last.expand(shape)?))
    }

    /// Broadcast to `target` by NumPy right-alignment rules.
    pub fn broadcast_to(&self, target: &[usize]) -> Result<ShapeTracker> {
        let added: Vec<usize> = (0..target.len() - self.ndim()).collect();
        let mut tracker = self.broadcast(
            &{
                let mut s: Vec<usize> = vec![1; target.len() - self.ndim()];
                s.extend_from_slice(self.shape());
                // Unit axes that must widen keep their size for now.
                s
            },
            &added,
        )?;
        let last = tracker.views.last().expect("tracker has at least one view");
        tracker = tracker.with_last(last.expand(target)?);
        Ok(tracker)
    }

    /// Zero-pad each axis by `(left, right)`, encoded via the mask.
    pub fn pad(&self, widths: &[(usize, usize)]) -> Result<ShapeTracker> {
        if widths.len() != self.ndim() {
            return Err(Error::Type(format!(
                "pad expects {} width pairs, got {}",
                self.ndim(),
                widths.len()
            )));
        }
        let last = self.views.last().expect("tracker has at least one view");
        Ok(self.with_last(last.pad(widths)))
    }

    /// Restrict each axis to `[lo, hi)`.
    pub fn shrink(&self, ranges: &[(usize, usize)]) -> Result<ShapeTracker> {
        for (k, &(lo, hi)) in ranges.iter().enumerate() {
            if lo > hi || hi > self.shape()[k] {
                return Err(Error::Type(format!(
                    "invalid shrink range ({}, {}) on axis {} of size {}",
                    lo, hi, k, self.shape()[k]
                )));
            }
        }
        let last = self.views.last().expect("tracker has at least one view");
        Ok(self.with_last(last.shrink(ranges)))
    }

    /// Signed pad-or-shrink: per axis `(before, after)`, negative amounts
    /// shrink from that side, positive amounts pad.
    pub fn pad_or_shrink(&self, ranges: &[(isize, isize)]) -> Result<ShapeTracker> {
        let shrinks: Vec<(usize, usize)> = ranges
            .iter()
            .zip(self.shape().iter())
            .map(|(&(l, r), &n)| {
                let lo = if l < 0 { (-l) as usize } else { 0 };
                let hi = if r < 0 { n - (-r) as usize } else { n };
                (lo, hi)
            })
            .collect();
        let pads: Vec<(usize, usize)> = ranges
            .iter()
            .map(|&(l, r)| (l.max(0) as usize, r.max(0) as usize))
            .collect();
        self.shrink(&shrinks)?.pad(&pads)
    }

    /// Reverse the axes marked true.
    pub fn flip(&self, axes: &[bool]) -> Result<ShapeTracker> {
        if axes.len() != self.ndim() {
            return Err(Error::Type(format!(
                "flip expects {} axis flags, got {}",
                self.ndim(),
                axes.len()
            )));
        }
        let last = self.views.last().expect("tracker has at least one view");
        Ok(self.with_last(last.flip(axes)))
    }

    /// Tile each axis `counts[k]` times.
    pub fn repeat(&self, counts: &[usize]) -> Result<ShapeTracker> {
        if counts.len() != self.ndim() {
            return Err(Error::Type(format!(
                "repeat expects {} counts, got {}",
                self.ndim(),
                counts.len()
            )));
        }
        // (s0, s1, ...) -> (1, s0, 1, s1, ...) -> (c0, s0, c1, s1, ...)
        // -> (c0*s0, c1*s1, ...). The final merge generally composes a view,
        // putting the tiling modulo into the index expression.
        let mut interleaved = Vec::with_capacity(self.ndim() * 2);
        let mut expanded = Vec::with_capacity(self.ndim() * 2);
        let mut merged = Vec::with_capacity(self.ndim());
        for (&n, &c) in self.shape().iter().zip(counts.iter()) {
            interleaved.extend_from_slice(&[1, n]);
            expanded.extend_from_slice(&[c, n]);
            merged.push(c * n);
        }
        let tracker = self.reshape(&interleaved)?;
        let last = tracker.views.last().expect("tracker has at least one view");
        let tracker = tracker.with_last(last.expand(&expanded)?);
        tracker.reshape(&merged)
    }

    /// Move axis `src` to position `dst`, keeping the order of the others.
    pub fn moveaxis(&self, src: usize, dst: usize) -> Result<ShapeTracker> {
        if src >= self.ndim() || dst >= self.ndim() {
            return Err(Error::Type(format!(
                "moveaxis({}, {}) out of range for rank {}",
                src,
                dst,
                self.ndim()
            )));
        }
        let mut axes: Vec<usize> = (0..self.ndim()).filter(|&k| k != src).collect();
        axes.insert(dst, src);
        self.permute(&axes)
    }

    /// Sequence two trackers: the result maps this tracker's logical index
    /// through itself, then through `inner`.
    pub fn compose(&self, inner: &ShapeTracker) -> Result<ShapeTracker> {
        if self.views[0].size() != inner.size() {
            return Err(Error::Type(format!(
                "cannot compose tracker over {:?} with inner logical shape {:?}",
                self.views[0].shape,
                inner.shape()
            )));
        }
        let mut views = inner.views.clone();
        views.extend(self.views.iter().cloned());
        Ok(ShapeTracker { views })
    }

    /// Physical offset and validity for one logical index.
    pub fn locate(&self, idx: &[i64]) -> (i64, bool) {
        let mut valid = true;
        let mut idx: Vec<i64> = idx.to_vec();
        for (level, view) in self.views.iter().enumerate().rev() {
            let (flat, ok) = view.locate(&idx);
            valid &= ok;
            if level == 0 {
                return (flat, valid);
            }
            if !valid {
                return (0, false);
            }
            idx = unravel_host(&self.views[level - 1].shape, flat);
        }
        unreachable!("tracker has at least one view")
    }

    /// Lower a logical index vector to `(physical_offset, valid)` symbolic
    /// expressions by composing every view right-to-left.
    pub fn to_alu(&self, indices: &[AluExp]) -> Result<(AluExp, AluExp)> {
        if indices.len() != self.ndim() {
            return Err(Error::Type(format!(
                "tracker of rank {} indexed with {} indices",
                self.ndim(),
                indices.len()
            )));
        }
        let mut valid = AluExp::constant(crate::Scalar::Bool(true));
        let mut idx: Vec<AluExp> = indices.to_vec();
        for (level, view) in self.views.iter().enumerate().rev() {
            let (flat, ok) = view.to_alu(&idx)?;
            valid = AluExp::and(valid, ok)?;
            if level == 0 {
                return Ok((flat, valid));
            }
            idx = unravel_alu(&self.views[level - 1].shape, &flat)?;
        }
        unreachable!("tracker has at least one view")
    }

    /// Lower a `GlobalView` read of this tracker into a guarded
    /// `GlobalIndex` read: `where(valid, buf[offset], 0)`.
    pub fn lower_read(
        &self,
        gid: usize,
        dtype: DType,
        indices: &[AluExp],
    ) -> Result<AluExp> {
        let (offset, valid) = self.to_alu(indices)?;
        let read = AluExp::global_index(gid, dtype, offset)?;
        if valid.resolve() == Some(crate::Scalar::Bool(true)) {
            return Ok(read);
        }
        AluExp::where_(valid, read, AluExp::constant(crate::Scalar::from_f64(0.0, dtype)))
    }
}

fn unravel_host(shape: &[usize], flat: i64) -> Vec<i64> {
    let mut out = vec![0i64; shape.len()];
    let mut rest = flat;
    for k in (0..shape.len()).rev() {
        let n = shape[k] as i64;
        out[k] = rest.rem_euclid(n);
        rest = rest.div_euclid(n);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn offsets(t: &ShapeTracker) -> Vec<(i64, bool)> {
        let shape = t.shape().to_vec();
        let size: usize = shape.iter().product();
        (0..size)
            .map(|flat| {
                let idx = unravel_host(&shape, flat as i64);
                t.locate(&idx)
            })
            .collect()
    }

    #[test]
    fn test_contiguous() {
        let t = ShapeTracker::contiguous(&[2, 3]);
        assert!(t.is_contiguous());
        assert_eq!(t.locate(&[0, 0]), (0, true));
        assert_eq!(t.locate(&[1, 2]), (5, true));
    }

    #[test]
    fn test_scalar_tracker() {
        let t = ShapeTracker::contiguous(&[]);
        assert_eq!(t.ndim(), 0);
        assert_eq!(t.size(), 1);
        assert_eq!(t.locate(&[]), (0, true));
        let (off, valid) = t.to_alu(&[]).unwrap();
        assert_eq!(off.resolve(), Some(crate::Scalar::I32(0)));
        assert_eq!(valid.resolve(), Some(crate::Scalar::Bool(true)));
    }

    #[test]
    fn test_permute() {
        let t = ShapeTracker::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.locate(&[2, 1]), (5, true));
        assert_eq!(t.locate(&[0, 1]), (3, true));
    }

    #[test]
    fn test_broadcast_stride_zero() {
        let t = ShapeTracker::contiguous(&[3]).broadcast(&[2, 3], &[0]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.locate(&[0, 1]), (1, true));
        assert_eq!(t.locate(&[1, 1]), (1, true));
    }

    #[test]
    fn test_pad_mask_and_zero_region() {
        let t = ShapeTracker::contiguous(&[2]).pad(&[(1, 1)]).unwrap();
        assert_eq!(t.shape(), &[4]);
        assert_eq!(t.locate(&[0]), (0, false));
        assert_eq!(t.locate(&[1]), (0, true));
        assert_eq!(t.locate(&[2]), (1, true));
        assert_eq!(t.locate(&[3]), (0, false));
    }

    #[test]
    fn test_shrink() {
        let t = ShapeTracker::contiguous(&[4]).shrink(&[(1, 3)]).unwrap();
        assert_eq!(t.shape(), &[2]);
        assert_eq!(t.locate(&[0]), (1, true));
        assert_eq!(t.locate(&[1]), (2, true));
    }

    #[test]
    fn test_pad_or_shrink_signed() {
        // shrink one from the left, pad one on the right
        let t = ShapeTracker::contiguous(&[4]).pad_or_shrink(&[(-1, 1)]).unwrap();
        assert_eq!(t.shape(), &[4]);
        assert_eq!(t.locate(&[0]), (1, true));
        assert_eq!(t.locate(&[2]), (3, true));
        assert_eq!(t.locate(&[3]).1, false);
    }

    #[test]
    fn test_flip() {
        let t = ShapeTracker::contiguous(&[3]).flip(&[true]).unwrap();
        assert_eq!(t.locate(&[0]), (2, true));
        assert_eq!(t.locate(&[2]), (0, true));
    }

    #[test]
    fn test_pad_then_shrink_roundtrip() {
        let t = ShapeTracker::contiguous(&[3]);
        let padded = t.pad(&[(2, 0)]).unwrap();
        let back = padded.shrink(&[(2, 5)]).unwrap();
        assert_eq!(offsets(&back), offsets(&t));
    }

    #[test]
    fn test_repeat_tiles() {
        let t = ShapeTracker::contiguous(&[3]).repeat(&[2]).unwrap();
        assert_eq!(t.shape(), &[6]);
        let got: Vec<i64> = offsets(&t).iter().map(|&(o, _)| o).collect();
        assert_eq!(got, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_moveaxis() {
        let t = ShapeTracker::contiguous(&[2, 3, 4]).moveaxis(2, 0).unwrap();
        assert_eq!(t.shape(), &[4, 2, 3]);
        assert_eq!(t.locate(&[1, 0, 0]), (1, true));
        assert_eq!(t.locate(&[0, 1, 0]), (12, true));
    }

    #[test]
    fn test_reshape_merge_contiguous() {
        let t = ShapeTracker::contiguous(&[2, 3]).reshape(&[6]).unwrap();
        assert_eq!(t.views.len(), 1);
        assert_eq!(t.locate(&[4]), (4, true));
    }

    #[test]
    fn test_reshape_unit_axes_in_place() {
        let t = ShapeTracker::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
        let t2 = t.reshape(&[3, 1, 2]).unwrap();
        assert_eq!(t2.views.len(), 1);
        assert_eq!(t2.locate(&[2, 0, 1]), (5, true));
    }

    #[test]
    fn test_reshape_pushes_view_when_needed() {
        // Transposed non-contiguous view flattened: needs a second view.
        let t = ShapeTracker::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
        let flat = t.reshape(&[6]).unwrap();
        assert!(flat.views.len() > 1);
        // Logical order after transpose: (0,0)(0,1)(1,0)(1,1)(2,0)(2,1)
        let got: Vec<i64> = offsets(&flat).iter().map(|&(o, _)| o).collect();
        assert_eq!(got, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_reshape_size_mismatch() {
        assert!(ShapeTracker::contiguous(&[2, 3]).reshape(&[7]).is_err());
    }

    #[test]
    fn test_compose() {
        let inner = ShapeTracker::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
        let outer = ShapeTracker::contiguous(&[6]);
        let both = outer.compose(&inner).unwrap();
        let direct = inner.reshape(&[6]).unwrap();
        assert_eq!(offsets(&both), offsets(&direct));
    }

    #[test]
    fn test_to_alu_matches_locate() {
        let t = ShapeTracker::contiguous(&[2, 3, 4])
            .permute(&[2, 0, 1])
            .unwrap()
            .pad(&[(0, 1), (1, 0), (0, 0)])
            .unwrap()
            .reshape(&[5, 9])
            .unwrap();
        let shape = t.shape().to_vec();
        let gidx = AluExp::special("gidx", t.size() as i64);
        let indices = unravel_alu(&shape, &gidx).unwrap();
        let (off_exp, valid_exp) = t.to_alu(&indices).unwrap();
        let mut no_globals = |_: usize, _: i64, _: DType| -> crate::Scalar { panic!() };
        for flat in 0..t.size() as i64 {
            let vars: HashMap<String, i64> = [("gidx".to_string(), flat)].into();
            let idx = unravel_host(&shape, flat);
            let (want_off, want_valid) = t.locate(&idx);
            let got_valid = matches!(
                valid_exp.evaluate(&vars, &mut no_globals),
                crate::Scalar::Bool(true)
            );
            assert_eq!(got_valid, want_valid, "valid mismatch at {}", flat);
            if want_valid {
                let got_off = match off_exp.evaluate(&vars, &mut no_globals) {
                    crate::Scalar::I32(v) => v as i64,
                    other => panic!("{:?}", other),
                };
                assert_eq!(got_off, want_off, "offset mismatch at {}", flat);
            }
        }
    }

    #[test]
    fn test_broadcast_valid_elision() {
        // A plain broadcast has no mask, so lowering yields a constant-true
        // valid bit and a direct read.
        let t = ShapeTracker::contiguous(&[3]).broadcast(&[2, 3], &[0]).unwrap();
        let gidx = AluExp::special("gidx", 6);
        let indices = unravel_alu(t.shape(), &gidx).unwrap();
        let (_, valid) = t.to_alu(&indices).unwrap();
        assert_eq!(valid.resolve(), Some(crate::Scalar::Bool(true)));
    }
}
