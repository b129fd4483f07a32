//! NAS Primitive Operations
//!
//! Descriptors for the operations that sit on the edges of a search-space
//! graph. They carry shapes and hyperparameters only; instantiating the
//! actual tensors is left to the training harness.

use serde::{Deserialize, Serialize};

/// Types of operations that can sit on an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Identity (skip connection)
    Identity,
    /// Zero operation, drops the edge
    Zero,
    /// Max pooling followed by optional batch norm
    MaxPool,
    /// Average pooling followed by optional batch norm
    AvgPool,
    /// Depthwise-separable convolution
    SepConv,
    /// Dilated convolution
    DilConv,
    /// Strided reduction of the spatial resolution
    FactorizedReduce,
    /// Stem convolution at the network input
    Stem,
    /// ReLU, convolution and batch norm
    ReLUConvBN,
    /// Stack of plain layers (classifier heads)
    Sequential,
}

/// Plain layer used inside [`OperationType::Sequential`] heads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    ReLU,
    AvgPool2d {
        kernel_size: usize,
        stride: usize,
        padding: usize,
    },
    AdaptiveAvgPool2d {
        output_size: usize,
    },
    Conv2d {
        c_in: usize,
        c_out: usize,
        kernel_size: usize,
    },
    BatchNorm2d {
        num_features: usize,
    },
    Flatten,
    Linear {
        in_features: usize,
        out_features: usize,
    },
}

/// How a node combines the outputs of its incoming edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CombineOp {
    /// Element-wise sum
    #[default]
    Sum,
    /// Concatenation along the channel dimension
    ChannelConcat,
}

/// Cell type in the architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CellType {
    /// Normal cell (preserves dimensions)
    Normal,
    /// Reduction cell (halves the resolution)
    Reduction,
}

impl CellType {
    /// Name shared by every instance of this cell type
    pub fn cell_name(&self) -> &'static str {
        match self {
            CellType::Normal => "normal_cell",
            CellType::Reduction => "reduction_cell",
        }
    }

    /// Inverse of [`CellType::cell_name`]
    pub fn from_cell_name(name: &str) -> Option<Self> {
        match name {
            "normal_cell" => Some(CellType::Normal),
            "reduction_cell" => Some(CellType::Reduction),
            _ => None,
        }
    }

    pub fn all() -> [CellType; 2] {
        [CellType::Normal, CellType::Reduction]
    }
}

/// A single operation with parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation type
    pub op_type: OperationType,
    /// Input channels
    pub c_in: Option<usize>,
    /// Output channels
    pub c_out: Option<usize>,
    /// Kernel size (convolutions and pooling)
    pub kernel_size: Option<usize>,
    /// Stride
    pub stride: usize,
    /// Padding
    pub padding: Option<usize>,
    /// Dilation rate (for dilated conv)
    pub dilation: Option<usize>,
    /// Learnable affine parameters in batch norm
    pub affine: bool,
    /// Batch norm after pooling
    pub use_bn: bool,
    /// Layers of a sequential head
    pub layers: Vec<Layer>,
}

impl Operation {
    /// Create a new operation
    pub fn new(op_type: OperationType) -> Self {
        Self {
            op_type,
            c_in: None,
            c_out: None,
            kernel_size: None,
            stride: 1,
            padding: None,
            dilation: None,
            affine: true,
            use_bn: false,
            layers: Vec::new(),
        }
    }

    /// Set input and output channels
    pub fn with_channels(mut self, c_in: usize, c_out: usize) -> Self {
        self.c_in = Some(c_in);
        self.c_out = Some(c_out);
        self
    }

    /// Set kernel size
    pub fn with_kernel_size(mut self, size: usize) -> Self {
        self.kernel_size = Some(size);
        self
    }

    /// Set stride
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Set padding
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Set dilation
    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = Some(dilation);
        self
    }

    /// Toggle affine batch norm parameters
    pub fn with_affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    /// Toggle batch norm after pooling
    pub fn with_bn(mut self, use_bn: bool) -> Self {
        self.use_bn = use_bn;
        self
    }

    /// Create skip connection
    pub fn identity() -> Self {
        Self::new(OperationType::Identity)
    }

    /// Create zero operation
    pub fn zero(stride: usize) -> Self {
        Self::new(OperationType::Zero).with_stride(stride)
    }

    /// Create max pooling
    pub fn max_pool(channels: usize, kernel_size: usize, stride: usize) -> Self {
        Self::new(OperationType::MaxPool)
            .with_channels(channels, channels)
            .with_kernel_size(kernel_size)
            .with_stride(stride)
            .with_padding(1)
            .with_bn(true)
    }

    /// Create average pooling
    pub fn avg_pool(channels: usize, kernel_size: usize, stride: usize) -> Self {
        Self::new(OperationType::AvgPool)
            .with_channels(channels, channels)
            .with_kernel_size(kernel_size)
            .with_stride(stride)
            .with_padding(1)
            .with_bn(true)
    }

    /// Create separable convolution
    pub fn sep_conv(c_in: usize, c_out: usize, kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self::new(OperationType::SepConv)
            .with_channels(c_in, c_out)
            .with_kernel_size(kernel_size)
            .with_stride(stride)
            .with_padding(padding)
            .with_affine(false)
    }

    /// Create dilated convolution
    pub fn dil_conv(
        c_in: usize,
        c_out: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
    ) -> Self {
        Self::new(OperationType::DilConv)
            .with_channels(c_in, c_out)
            .with_kernel_size(kernel_size)
            .with_stride(stride)
            .with_padding(padding)
            .with_dilation(dilation)
            .with_affine(false)
    }

    /// Create factorized reduce
    pub fn factorized_reduce(c_in: usize, c_out: usize, stride: usize) -> Self {
        Self::new(OperationType::FactorizedReduce)
            .with_channels(c_in, c_out)
            .with_stride(stride)
    }

    /// Create stem convolution
    pub fn stem(c_in: usize, c_out: usize) -> Self {
        Self::new(OperationType::Stem)
            .with_channels(c_in, c_out)
            .with_kernel_size(3)
            .with_padding(1)
    }

    /// Create ReLU-Conv-BN block
    pub fn relu_conv_bn(c_in: usize, c_out: usize, kernel_size: usize) -> Self {
        Self::new(OperationType::ReLUConvBN)
            .with_channels(c_in, c_out)
            .with_kernel_size(kernel_size)
            .with_padding(0)
    }

    /// Create a sequential head
    pub fn sequential(layers: Vec<Layer>) -> Self {
        let mut op = Self::new(OperationType::Sequential);
        op.layers = layers;
        op
    }

    /// Whether this is the zero operation
    pub fn is_zero(&self) -> bool {
        self.op_type == OperationType::Zero
    }

    /// Name of the primitive in DARTS genotypes, if it is a cell primitive
    pub fn genotype_name(&self) -> Option<&'static str> {
        match (self.op_type, self.kernel_size) {
            (OperationType::Zero, _) => Some("none"),
            (OperationType::Identity, _) | (OperationType::FactorizedReduce, _) => Some("skip_connect"),
            (OperationType::MaxPool, Some(3)) => Some("max_pool_3x3"),
            (OperationType::AvgPool, Some(3)) => Some("avg_pool_3x3"),
            (OperationType::SepConv, Some(3)) => Some("sep_conv_3x3"),
            (OperationType::SepConv, Some(5)) => Some("sep_conv_5x5"),
            (OperationType::DilConv, Some(3)) => Some("dil_conv_3x3"),
            (OperationType::DilConv, Some(5)) => Some("dil_conv_5x5"),
            _ => None,
        }
    }

    /// Same primitive choice regardless of channel counts
    pub fn same_primitive(&self, other: &Operation) -> bool {
        self.op_type == other.op_type && self.kernel_size == other.kernel_size
    }
}

/// The eight candidate primitives of a DARTS cell edge
pub fn darts_primitives(channels: usize, stride: usize) -> Vec<Operation> {
    let skip = if stride == 1 {
        Operation::identity()
    } else {
        Operation::factorized_reduce(channels, channels, stride).with_affine(false)
    };

    vec![
        skip,
        Operation::zero(stride),
        Operation::max_pool(channels, 3, stride),
        Operation::avg_pool(channels, 3, stride),
        Operation::sep_conv(channels, channels, 3, stride, 1),
        Operation::sep_conv(channels, channels, 5, stride, 2),
        Operation::dil_conv(channels, channels, 3, stride, 2, 2),
        Operation::dil_conv(channels, channels, 5, stride, 4, 2),
    ]
}
