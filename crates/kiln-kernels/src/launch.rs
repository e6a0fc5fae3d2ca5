//! Typed launch operations.
//!
//! Each [`Launch`] variant fixes one kernel calling convention: which buffers
//! exist, their direction and size, the argument slot order, and the element
//! count that drives the work size. The device kernels index their arguments
//! positionally, so the orders below are a contract with the kernel source:
//!
//! | Variant        | Argument slots                                   | Work items            |
//! |----------------|--------------------------------------------------|-----------------------|
//! | `Convolution`  | `in, rows, cols, in_ch, filter, k, out_ch, out`  | `out_ch * rows * cols`|
//! | `DenseMultiply`| `left, r1, c1, right, r2, c2, out`               | `r1 * c2`             |
//! | `Pool`         | `in, rows, cols, k, ch, out`                     | `ch * rows * cols`    |
//! | `Elementwise`  | `data, rows, cols` (read-write, in place)        | `rows * cols`         |
//! | `Preprocess`   | `rgb_bytes, rows, cols, out`                     | `rows * cols`         |
//!
//! All scalar arguments are 32-bit signed ints on the device side.

use std::fmt;

use crate::backend::MemAccess;
use crate::error::PreconditionError;

type Checked<T> = Result<T, PreconditionError>;

// ============================================================================
// Shape records
// ============================================================================

/// Same-size 2D convolution over a `in_channels × rows × cols` tensor with an
/// `out_channels × in_channels × filter_size × filter_size` filter bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub rows: usize,
    pub cols: usize,
    pub in_channels: usize,
    pub filter_size: usize,
    pub out_channels: usize,
}

impl ConvShape {
    pub fn input_len(&self) -> usize {
        self.in_channels * self.rows * self.cols
    }

    pub fn filter_len(&self) -> usize {
        self.out_channels * self.in_channels * self.filter_size * self.filter_size
    }

    pub fn output_len(&self) -> usize {
        self.out_channels * self.rows * self.cols
    }
}

/// `(left_rows × left_cols) · (right_rows × right_cols)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulShape {
    pub left_rows: usize,
    pub left_cols: usize,
    pub right_rows: usize,
    pub right_cols: usize,
}

impl MatMulShape {
    pub fn output_len(&self) -> usize {
        self.left_rows * self.right_cols
    }
}

/// Pooling over `channels × rows × cols`; output is `channels × rows/2 × cols/2`.
///
/// `filter_size` is forwarded to the kernel untouched. The dispatcher only
/// relies on the halving output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShape {
    pub rows: usize,
    pub cols: usize,
    pub filter_size: usize,
    pub channels: usize,
}

impl PoolShape {
    pub fn input_len(&self) -> usize {
        self.channels * self.rows * self.cols
    }

    pub fn output_len(&self) -> usize {
        self.channels * (self.rows / 2) * (self.cols / 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementwiseShape {
    pub rows: usize,
    pub cols: usize,
}

impl ElementwiseShape {
    /// A flat vector of `len` elements, laid out as `len × 1`.
    pub fn flat(len: usize) -> Self {
        Self { rows: len, cols: 1 }
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An interleaved 3-channel byte image of `rows × cols` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub rows: usize,
    pub cols: usize,
}

impl ImageShape {
    pub fn pixels(&self) -> usize {
        self.rows * self.cols
    }
}

// ============================================================================
// Launch variants
// ============================================================================

pub struct Convolution<'a> {
    pub shape: ConvShape,
    pub input: &'a [f32],
    pub filter: &'a [f32],
    pub output: &'a mut [f32],
}

pub struct DenseMultiply<'a> {
    pub shape: MatMulShape,
    pub left: &'a [f32],
    pub right: &'a [f32],
    pub output: &'a mut [f32],
}

pub struct Pool<'a> {
    pub shape: PoolShape,
    pub input: &'a [f32],
    pub output: &'a mut [f32],
}

pub struct Elementwise<'a> {
    pub shape: ElementwiseShape,
    pub data: &'a mut [f32],
}

pub struct Preprocess<'a> {
    pub shape: ImageShape,
    pub image: &'a [u8],
    pub output: &'a mut [f32],
}

/// One kernel invocation with its host data.
pub enum Launch<'a> {
    Convolution(Convolution<'a>),
    DenseMultiply(DenseMultiply<'a>),
    Pool(Pool<'a>),
    Elementwise(Elementwise<'a>),
    Preprocess(Preprocess<'a>),
}

/// Tag of a [`Launch`], for reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchKind {
    Convolution,
    DenseMultiply,
    Pool,
    Elementwise,
    Preprocess,
}

impl LaunchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchKind::Convolution => "convolution",
            LaunchKind::DenseMultiply => "dense_multiply",
            LaunchKind::Pool => "pool",
            LaunchKind::Elementwise => "elementwise",
            LaunchKind::Preprocess => "preprocess",
        }
    }
}

impl fmt::Display for LaunchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Launch<'_> {
    pub fn kind(&self) -> LaunchKind {
        match self {
            Launch::Convolution(_) => LaunchKind::Convolution,
            Launch::DenseMultiply(_) => LaunchKind::DenseMultiply,
            Launch::Pool(_) => LaunchKind::Pool,
            Launch::Elementwise(_) => LaunchKind::Elementwise,
            Launch::Preprocess(_) => LaunchKind::Preprocess,
        }
    }
}

// ============================================================================
// Launch plans
// ============================================================================

/// Where a buffer's initial contents come from.
pub(crate) enum Stage<'a> {
    /// Uninitialized; the kernel writes it.
    None,
    Host(&'a [u8]),
    /// Staged from the plan's output slice (in-place launches).
    Output,
}

pub(crate) struct BufferSpec<'a> {
    pub access: MemAccess,
    pub nbytes: usize,
    pub stage: Stage<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgSpec {
    Buffer(usize),
    Int(i32),
}

/// A validated launch, flattened into buffers and argument slots.
pub(crate) struct LaunchPlan<'a> {
    pub kind: LaunchKind,
    pub elements: usize,
    pub buffers: Vec<BufferSpec<'a>>,
    pub args: Vec<ArgSpec>,
    /// Index into `buffers` read back into `output`.
    pub result: usize,
    pub output: &'a mut [u8],
}

impl<'a> Launch<'a> {
    /// Check every shape precondition and lay out buffers and arguments.
    pub(crate) fn plan(self) -> Checked<LaunchPlan<'a>> {
        match self {
            Launch::Convolution(op) => plan_convolution(op),
            Launch::DenseMultiply(op) => plan_dense_multiply(op),
            Launch::Pool(op) => plan_pool(op),
            Launch::Elementwise(op) => plan_elementwise(op),
            Launch::Preprocess(op) => plan_preprocess(op),
        }
    }
}

fn plan_convolution(op: Convolution<'_>) -> Checked<LaunchPlan<'_>> {
    let s = op.shape;
    let name = "convolution";
    nonzero(name, &[s.rows, s.cols, s.in_channels, s.filter_size, s.out_channels])?;

    let input_len = int_extent("convolution input", product(name, &[s.in_channels, s.rows, s.cols])?)?;
    let filter_len = int_extent(
        "convolution filter",
        product(name, &[s.out_channels, s.in_channels, s.filter_size, s.filter_size])?,
    )?;
    let output_len = int_extent("convolution output", product(name, &[s.out_channels, s.rows, s.cols])?)?;
    expect_len("convolution input", input_len, op.input.len())?;
    expect_len("convolution filter", filter_len, op.filter.len())?;
    expect_len("convolution output", output_len, op.output.len())?;

    Ok(LaunchPlan {
        kind: LaunchKind::Convolution,
        elements: output_len,
        buffers: vec![
            read_only(name, op.input)?,
            read_only(name, op.filter)?,
            write_only(name, output_len)?,
        ],
        args: vec![
            ArgSpec::Buffer(0),
            int("rows", s.rows)?,
            int("cols", s.cols)?,
            int("in_channels", s.in_channels)?,
            ArgSpec::Buffer(1),
            int("filter_size", s.filter_size)?,
            int("out_channels", s.out_channels)?,
            ArgSpec::Buffer(2),
        ],
        result: 2,
        output: bytemuck::cast_slice_mut(op.output),
    })
}

fn plan_dense_multiply(op: DenseMultiply<'_>) -> Checked<LaunchPlan<'_>> {
    let s = op.shape;
    let name = "dense_multiply";
    nonzero(name, &[s.left_rows, s.left_cols, s.right_rows, s.right_cols])?;
    if s.left_cols != s.right_rows {
        return Err(PreconditionError::InnerDimMismatch {
            left_cols: s.left_cols,
            right_rows: s.right_rows,
        });
    }

    let left_len = int_extent("dense_multiply left", product(name, &[s.left_rows, s.left_cols])?)?;
    let right_len = int_extent("dense_multiply right", product(name, &[s.right_rows, s.right_cols])?)?;
    let output_len = int_extent("dense_multiply output", product(name, &[s.left_rows, s.right_cols])?)?;
    expect_len("dense_multiply left", left_len, op.left.len())?;
    expect_len("dense_multiply right", right_len, op.right.len())?;
    expect_len("dense_multiply output", output_len, op.output.len())?;

    Ok(LaunchPlan {
        kind: LaunchKind::DenseMultiply,
        elements: output_len,
        buffers: vec![
            read_only(name, op.left)?,
            read_only(name, op.right)?,
            write_only(name, output_len)?,
        ],
        args: vec![
            ArgSpec::Buffer(0),
            int("left_rows", s.left_rows)?,
            int("left_cols", s.left_cols)?,
            ArgSpec::Buffer(1),
            int("right_rows", s.right_rows)?,
            int("right_cols", s.right_cols)?,
            ArgSpec::Buffer(2),
        ],
        result: 2,
        output: bytemuck::cast_slice_mut(op.output),
    })
}

fn plan_pool(op: Pool<'_>) -> Checked<LaunchPlan<'_>> {
    let s = op.shape;
    let name = "pool";
    nonzero(name, &[s.rows, s.cols, s.filter_size, s.channels])?;
    if s.rows % 2 != 0 || s.cols % 2 != 0 {
        return Err(PreconditionError::OddPoolDims { rows: s.rows, cols: s.cols });
    }

    let input_len = int_extent("pool input", product(name, &[s.channels, s.rows, s.cols])?)?;
    let output_len = s.output_len();
    expect_len("pool input", input_len, op.input.len())?;
    expect_len("pool output", output_len, op.output.len())?;

    Ok(LaunchPlan {
        kind: LaunchKind::Pool,
        // Work is sized by the input, not the halved output.
        elements: input_len,
        buffers: vec![read_only(name, op.input)?, write_only(name, output_len)?],
        args: vec![
            ArgSpec::Buffer(0),
            int("rows", s.rows)?,
            int("cols", s.cols)?,
            int("filter_size", s.filter_size)?,
            int("channels", s.channels)?,
            ArgSpec::Buffer(1),
        ],
        result: 1,
        output: bytemuck::cast_slice_mut(op.output),
    })
}

fn plan_elementwise(op: Elementwise<'_>) -> Checked<LaunchPlan<'_>> {
    let s = op.shape;
    let name = "elementwise";
    nonzero(name, &[s.rows, s.cols])?;

    let len = int_extent("elementwise data", product(name, &[s.rows, s.cols])?)?;
    expect_len("elementwise data", len, op.data.len())?;

    Ok(LaunchPlan {
        kind: LaunchKind::Elementwise,
        elements: len,
        buffers: vec![BufferSpec {
            access: MemAccess::ReadWrite,
            nbytes: f32_bytes(name, len)?,
            stage: Stage::Output,
        }],
        args: vec![ArgSpec::Buffer(0), int("rows", s.rows)?, int("cols", s.cols)?],
        result: 0,
        output: bytemuck::cast_slice_mut(op.data),
    })
}

fn plan_preprocess(op: Preprocess<'_>) -> Checked<LaunchPlan<'_>> {
    let s = op.shape;
    let name = "preprocess";
    nonzero(name, &[s.rows, s.cols])?;

    let pixels = product(name, &[s.rows, s.cols])?;
    let image_len = int_extent("preprocess image", product(name, &[3, pixels])?)?;
    expect_len("preprocess image", image_len, op.image.len())?;
    expect_len("preprocess output", pixels, op.output.len())?;

    Ok(LaunchPlan {
        kind: LaunchKind::Preprocess,
        elements: pixels,
        buffers: vec![
            BufferSpec {
                access: MemAccess::ReadOnly,
                nbytes: image_len,
                stage: Stage::Host(op.image),
            },
            write_only(name, pixels)?,
        ],
        args: vec![
            ArgSpec::Buffer(0),
            int("rows", s.rows)?,
            int("cols", s.cols)?,
            ArgSpec::Buffer(1),
        ],
        result: 1,
        output: bytemuck::cast_slice_mut(op.output),
    })
}

// ----------------------------------------------------------------------------
// Validation helpers
// ----------------------------------------------------------------------------

fn nonzero(op: &'static str, dims: &[usize]) -> Checked<()> {
    if dims.iter().any(|&d| d == 0) {
        return Err(PreconditionError::EmptyShape { op });
    }
    Ok(())
}

fn product(op: &'static str, dims: &[usize]) -> Checked<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or(PreconditionError::WorkOverflow { op })
}

fn expect_len(arg: &'static str, expected: usize, actual: usize) -> Checked<()> {
    if expected != actual {
        return Err(PreconditionError::LengthMismatch { arg, expected, actual });
    }
    Ok(())
}

/// Kernels index tensors with `int`, so every extent must fit one.
fn int_extent(arg: &'static str, len: usize) -> Checked<usize> {
    if i32::try_from(len).is_err() {
        return Err(PreconditionError::DimOverflow { arg, value: len });
    }
    Ok(len)
}

fn int(arg: &'static str, value: usize) -> Checked<ArgSpec> {
    i32::try_from(value)
        .map(ArgSpec::Int)
        .map_err(|_| PreconditionError::DimOverflow { arg, value })
}

fn f32_bytes(op: &'static str, len: usize) -> Checked<usize> {
    len.checked_mul(std::mem::size_of::<f32>())
        .ok_or(PreconditionError::WorkOverflow { op })
}

fn read_only<'a>(op: &'static str, data: &'a [f32]) -> Checked<BufferSpec<'a>> {
    Ok(BufferSpec {
        access: MemAccess::ReadOnly,
        nbytes: f32_bytes(op, data.len())?,
        stage: Stage::Host(bytemuck::cast_slice(data)),
    })
}

fn write_only(op: &'static str, len: usize) -> Checked<BufferSpec<'static>> {
    Ok(BufferSpec {
        access: MemAccess::WriteOnly,
        nbytes: f32_bytes(op, len)?,
        stage: Stage::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(plan: &LaunchPlan<'_>) -> Vec<(MemAccess, usize)> {
        plan.buffers.iter().map(|b| (b.access, b.nbytes)).collect()
    }

    #[test]
    fn test_convolution_layout() {
        let shape = ConvShape { rows: 4, cols: 4, in_channels: 2, filter_size: 3, out_channels: 3 };
        let input = vec![0.0; shape.input_len()];
        let filter = vec![0.0; shape.filter_len()];
        let mut output = vec![0.0; shape.output_len()];
        let plan = Launch::Convolution(Convolution {
            shape,
            input: &input,
            filter: &filter,
            output: &mut output,
        })
        .plan()
        .unwrap();

        assert_eq!(plan.kind, LaunchKind::Convolution);
        assert_eq!(plan.elements, 48);
        assert_eq!(
            sizes(&plan),
            vec![
                (MemAccess::ReadOnly, 4 * 32),
                (MemAccess::ReadOnly, 4 * 54),
                (MemAccess::WriteOnly, 4 * 48),
            ]
        );
        assert_eq!(
            plan.args,
            vec![
                ArgSpec::Buffer(0),
                ArgSpec::Int(4),
                ArgSpec::Int(4),
                ArgSpec::Int(2),
                ArgSpec::Buffer(1),
                ArgSpec::Int(3),
                ArgSpec::Int(3),
                ArgSpec::Buffer(2),
            ]
        );
        assert_eq!(plan.result, 2);
        assert_eq!(plan.output.len(), 4 * 48);
    }

    #[test]
    fn test_dense_multiply_layout() {
        let shape = MatMulShape { left_rows: 2, left_cols: 3, right_rows: 3, right_cols: 2 };
        let left = [0.0; 6];
        let right = [0.0; 6];
        let mut output = [0.0; 4];
        let plan = Launch::DenseMultiply(DenseMultiply {
            shape,
            left: &left,
            right: &right,
            output: &mut output,
        })
        .plan()
        .unwrap();

        assert_eq!(plan.elements, 4);
        assert_eq!(
            plan.args,
            vec![
                ArgSpec::Buffer(0),
                ArgSpec::Int(2),
                ArgSpec::Int(3),
                ArgSpec::Buffer(1),
                ArgSpec::Int(3),
                ArgSpec::Int(2),
                ArgSpec::Buffer(2),
            ]
        );
    }

    #[test]
    fn test_dense_multiply_inner_mismatch() {
        let shape = MatMulShape { left_rows: 2, left_cols: 3, right_rows: 2, right_cols: 2 };
        let mut output = [0.0; 4];
        let err = Launch::DenseMultiply(DenseMultiply {
            shape,
            left: &[0.0; 6],
            right: &[0.0; 4],
            output: &mut output,
        })
        .plan()
        .err()
        .unwrap();
        assert_eq!(err, PreconditionError::InnerDimMismatch { left_cols: 3, right_rows: 2 });
    }

    #[test]
    fn test_pool_sized_by_input() {
        let shape = PoolShape { rows: 4, cols: 4, filter_size: 2, channels: 2 };
        let input = [0.0; 32];
        let mut output = [0.0; 8];
        let plan = Launch::Pool(Pool { shape, input: &input, output: &mut output })
            .plan()
            .unwrap();
        assert_eq!(plan.elements, 32);
        assert_eq!(
            sizes(&plan),
            vec![(MemAccess::ReadOnly, 128), (MemAccess::WriteOnly, 32)]
        );
        assert_eq!(plan.args[3], ArgSpec::Int(2));
        assert_eq!(plan.args[4], ArgSpec::Int(2));
    }

    #[test]
    fn test_pool_rejects_odd_dims() {
        let shape = PoolShape { rows: 5, cols: 4, filter_size: 2, channels: 1 };
        let mut output = [0.0; 4];
        let err = Launch::Pool(Pool { shape, input: &[0.0; 20], output: &mut output })
            .plan()
            .err()
            .unwrap();
        assert_eq!(err, PreconditionError::OddPoolDims { rows: 5, cols: 4 });
    }

    #[test]
    fn test_elementwise_is_read_write_in_place() {
        let mut data = [1.0f32, 2.0, 3.0];
        let plan = Launch::Elementwise(Elementwise {
            shape: ElementwiseShape::flat(3),
            data: &mut data,
        })
        .plan()
        .unwrap();
        assert_eq!(sizes(&plan), vec![(MemAccess::ReadWrite, 12)]);
        assert!(matches!(plan.buffers[0].stage, Stage::Output));
        assert_eq!(plan.result, 0);
    }

    #[test]
    fn test_preprocess_byte_input() {
        let image = [0u8; 3 * 6];
        let mut output = [0.0; 6];
        let plan = Launch::Preprocess(Preprocess {
            shape: ImageShape { rows: 2, cols: 3 },
            image: &image,
            output: &mut output,
        })
        .plan()
        .unwrap();
        assert_eq!(
            sizes(&plan),
            vec![(MemAccess::ReadOnly, 18), (MemAccess::WriteOnly, 24)]
        );
    }

    #[test]
    fn test_length_mismatch_names_argument() {
        let shape = ConvShape { rows: 2, cols: 2, in_channels: 1, filter_size: 3, out_channels: 1 };
        let mut output = [0.0; 4];
        let err = Launch::Convolution(Convolution {
            shape,
            input: &[0.0; 4],
            filter: &[0.0; 8],
            output: &mut output,
        })
        .plan()
        .err()
        .unwrap();
        assert_eq!(
            err,
            PreconditionError::LengthMismatch { arg: "convolution filter", expected: 9, actual: 8 }
        );
    }

    #[test]
    fn test_zero_dim_rejected() {
        let mut data: [f32; 0] = [];
        let err = Launch::Elementwise(Elementwise {
            shape: ElementwiseShape { rows: 0, cols: 4 },
            data: &mut data,
        })
        .plan()
        .err()
        .unwrap();
        assert_eq!(err, PreconditionError::EmptyShape { op: "elementwise" });
    }

    #[test]
    fn test_dim_overflow() {
        assert_eq!(
            int("rows", i32::MAX as usize + 1),
            Err(PreconditionError::DimOverflow { arg: "rows", value: i32::MAX as usize + 1 })
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_element_count_must_fit_kernel_int() {
        let shape = ConvShape { rows: 65536, cols: 65536, in_channels: 1, filter_size: 3, out_channels: 1 };
        let mut output: [f32; 0] = [];
        let err = Launch::Convolution(Convolution { shape, input: &[], filter: &[], output: &mut output })
            .plan()
            .err()
            .unwrap();
        assert_eq!(err, PreconditionError::DimOverflow { arg: "convolution input", value: 1 << 32 });

        let shape = MatMulShape { left_rows: 50_000, left_cols: 1, right_rows: 1, right_cols: 50_000 };
        let err = Launch::DenseMultiply(DenseMultiply {
            shape,
            left: &[],
            right: &[],
            output: &mut output,
        })
        .plan()
        .err()
        .unwrap();
        assert_eq!(
            err,
            PreconditionError::DimOverflow { arg: "dense_multiply output", value: 2_500_000_000 }
        );
    }
}
