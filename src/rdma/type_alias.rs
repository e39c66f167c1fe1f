/// [`usize`]: **Rank**, identifies a process within the job. Assigned by the bootstrap service.
pub type Rank = usize;

/// [`i32`]: **Tensor identifier**, caller-chosen tag matching a send with its receive.
/// Not required to be unique.
pub type TensorId = i32;
