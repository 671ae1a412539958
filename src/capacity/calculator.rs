//! Per-family allocation calculators.

use std::fmt;

use crate::model::StorageFamily;

/// Bytes in one 512-byte block.
pub const BLOCK_BYTES: u64 = 512;
/// Bytes in one mebibyte.
pub const MIB_BYTES: u64 = 1024 * 1024;
/// Cylinder size of the previous cylinder-addressed generation:
/// 15 tracks of 128 blocks.
pub const LEGACY_CYLINDER_BYTES: u64 = 15 * 128 * BLOCK_BYTES;
/// Cylinder size of the current cylinder-addressed generation.
pub const CURRENT_CYLINDER_BYTES: u64 = 2 * LEGACY_CYLINDER_BYTES;

/// Computes the bytes an array family actually allocates for a request.
pub trait AllocationCalculator: Send + Sync {
    /// Returns the capacity allocated when `requested` bytes are asked for.
    fn allocated_capacity(&self, requested: u64) -> u64;

    /// Whether this family can ever allocate exactly the same capacity as
    /// `other`.
    fn capacities_can_match(&self, other: StorageFamily) -> bool;

    /// Whether a tier change must keep the target at exactly the source's
    /// current provisioned capacity.
    fn requires_exact_tier_change_match(&self) -> bool {
        false
    }

    /// Allocation unit of meta-volume members, for families that expand by
    /// appending members.
    fn meta_member_unit(&self) -> Option<u64> {
        None
    }
}

/// Built-in calculator for one storage family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FamilyCalculator {
    family: StorageFamily,
}

impl FamilyCalculator {
    /// Creates the calculator of `family`.
    #[must_use]
    pub const fn new(family: StorageFamily) -> Self {
        Self { family }
    }

    const fn unit(self) -> u64 {
        match self.family {
            StorageFamily::Vmax2 => LEGACY_CYLINDER_BYTES,
            StorageFamily::Vmax3 => CURRENT_CYLINDER_BYTES,
            StorageFamily::Xtremio => MIB_BYTES,
            StorageFamily::VnxBlock | StorageFamily::Unity => BLOCK_BYTES,
            StorageFamily::Vplex | StorageFamily::Generic => 1,
        }
    }
}

impl AllocationCalculator for FamilyCalculator {
    fn allocated_capacity(&self, requested: u64) -> u64 {
        requested
            .checked_next_multiple_of(self.unit())
            .unwrap_or(requested)
    }

    fn capacities_can_match(&self, other: StorageFamily) -> bool {
        match self.family {
            StorageFamily::Vmax2 => !matches!(other, StorageFamily::Vmax3 | StorageFamily::Xtremio),
            StorageFamily::Vmax3 => !matches!(other, StorageFamily::Vmax2 | StorageFamily::Xtremio),
            StorageFamily::Xtremio => !other.is_cylinder_addressed(),
            StorageFamily::VnxBlock
            | StorageFamily::Unity
            | StorageFamily::Vplex
            | StorageFamily::Generic => true,
        }
    }

    fn requires_exact_tier_change_match(&self) -> bool {
        matches!(self.family, StorageFamily::Xtremio)
    }

    fn meta_member_unit(&self) -> Option<u64> {
        self.family.is_cylinder_addressed().then(|| self.unit())
    }
}

static VMAX2: FamilyCalculator = FamilyCalculator::new(StorageFamily::Vmax2);
static VMAX3: FamilyCalculator = FamilyCalculator::new(StorageFamily::Vmax3);
static XTREMIO: FamilyCalculator = FamilyCalculator::new(StorageFamily::Xtremio);
static VNX_BLOCK: FamilyCalculator = FamilyCalculator::new(StorageFamily::VnxBlock);
static UNITY: FamilyCalculator = FamilyCalculator::new(StorageFamily::Unity);
static VPLEX: FamilyCalculator = FamilyCalculator::new(StorageFamily::Vplex);
static GENERIC: FamilyCalculator = FamilyCalculator::new(StorageFamily::Generic);

const fn standard(family: StorageFamily) -> &'static FamilyCalculator {
    match family {
        StorageFamily::Vmax2 => &VMAX2,
        StorageFamily::Vmax3 => &VMAX3,
        StorageFamily::Xtremio => &XTREMIO,
        StorageFamily::VnxBlock => &VNX_BLOCK,
        StorageFamily::Unity => &UNITY,
        StorageFamily::Vplex => &VPLEX,
        StorageFamily::Generic => &GENERIC,
    }
}

/// Calculator lookup by family, with optional overrides.
#[derive(Default)]
pub struct CalculatorSet {
    overrides: Vec<(StorageFamily, Box<dyn AllocationCalculator>)>,
}

impl CalculatorSet {
    /// Creates a set using only the built-in calculators.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            overrides: Vec::new(),
        }
    }

    /// Replaces the calculator used for `family`.
    #[must_use]
    pub fn with_calculator(
        mut self,
        family: StorageFamily,
        calculator: impl AllocationCalculator + 'static,
    ) -> Self {
        self.overrides.retain(|(existing, _)| *existing != family);
        self.overrides.push((family, Box::new(calculator)));
        self
    }

    /// Returns the calculator for `family`.
    #[must_use]
    pub fn calculator(&self, family: StorageFamily) -> &dyn AllocationCalculator {
        self.overrides
            .iter()
            .find(|(existing, _)| *existing == family)
            .map_or(standard(family) as &dyn AllocationCalculator, |(_, calculator)| {
                calculator.as_ref()
            })
    }

    /// Whether `left` and `right` can allocate identical capacities, checked
    /// from both sides.
    #[must_use]
    pub fn capacities_can_match(&self, left: StorageFamily, right: StorageFamily) -> bool {
        self.calculator(left).capacities_can_match(right)
            && self.calculator(right).capacities_can_match(left)
    }
}

impl fmt::Debug for CalculatorSet {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CalculatorSet")
            .field(
                "overrides",
                &self
                    .overrides
                    .iter()
                    .map(|(family, _)| family.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
