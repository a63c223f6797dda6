//! Ghost-halo composition across a fully populated patch neighbourhood.

use proptest::prelude::*;
use std::sync::Arc;
use tessera_core::{Extents, Grid, MaterialIndex, PatchId, Rank, VarLabel};
use tessera_warehouse::{DataWarehouse, GhostBoundary, GridVariable, WarehouseConfig, Which};

/// A 3x3x3 split of a cube with `n` cells per patch edge.
fn cube_grid(n: i32) -> Arc<Grid> {
    Arc::new(Grid::uniform(Extents::new([0, 0, 0], [3 * n, 3 * n, 3 * n]), [3, 3, 3]).unwrap())
}

/// Value written to `cell` by the patch owning it.
fn signature(patch: PatchId, cell: [i32; 3]) -> f64 {
    patch.0 as f64 * 1000.0 + (cell[0] * 100 + cell[1] * 10 + cell[2]) as f64
}

fn populate(dw: &DataWarehouse, label: &VarLabel) {
    let patches: Vec<_> = dw.grid().patches().copied().collect();
    for patch in patches {
        let mut var = dw.allocate(label, patch.id, MaterialIndex(0), 0).unwrap();
        for cell in patch.extents.iter() {
            var[cell] = signature(patch.id, cell);
        }
        dw.put(var, label, patch.id, MaterialIndex(0), false).unwrap();
    }
}

// ── Halo shape ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn centre_halo_is_exactly_ghost_wider(n in 2i32..5, ghost in 1u32..3) {
        prop_assume!(ghost as i32 <= n);
        let grid = cube_grid(n);
        let config = WarehouseConfig {
            ghost_boundary: GhostBoundary::Fatal,
            ..WarehouseConfig::default()
        };
        let dw = DataWarehouse::new(Rank(0), Arc::clone(&grid), config).unwrap();
        let x = VarLabel::cell("X");
        populate(&dw, &x);

        let centre = PatchId(13);
        let own = grid.patch(centre).unwrap().extents;
        let got: Arc<GridVariable> =
            dw.get(Which::New, &x, centre, MaterialIndex(0), ghost).unwrap();

        prop_assert_eq!(got.extents(), own.grow(ghost));
        let own_dims = own.dims();
        let got_dims = got.extents().dims();
        for d in 0..3 {
            prop_assert_eq!(got_dims[d], own_dims[d] + 2 * ghost as usize);
        }
        // Every halo value is exactly what the owning neighbour put.
        for (cell, value) in got.iter() {
            let unit = Extents::new(cell, [cell[0] + 1, cell[1] + 1, cell[2] + 1]);
            let owner = grid.patches_intersecting(&unit);
            prop_assert_eq!(owner.len(), 1);
            prop_assert_eq!(value.to_bits(), signature(owner[0], cell).to_bits());
        }
    }
}

#[test]
fn corner_patch_clamps_to_domain_by_default() {
    let grid = cube_grid(2);
    let dw = DataWarehouse::new(Rank(0), Arc::clone(&grid), WarehouseConfig::default()).unwrap();
    let x = VarLabel::cell("X");
    populate(&dw, &x);
    let got = dw.get(Which::New, &x, PatchId(0), MaterialIndex(0), 1).unwrap();
    assert_eq!(got.extents(), Extents::new([0, 0, 0], [3, 3, 3]));
}

#[test]
fn corner_patch_fails_under_fatal_boundary() {
    let grid = cube_grid(2);
    let config = WarehouseConfig {
        ghost_boundary: GhostBoundary::Fatal,
        ..WarehouseConfig::default()
    };
    let dw = DataWarehouse::new(Rank(0), grid, config).unwrap();
    let x = VarLabel::cell("X");
    populate(&dw, &x);
    assert!(dw.get(Which::New, &x, PatchId(0), MaterialIndex(0), 1).is_err());
}

// ── Round trip ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn put_get_round_trip(
        patch in 0u32..27,
        material in 0u32..3,
        values in prop::collection::vec(-1.0e6f64..1.0e6, 8),
    ) {
        let grid = cube_grid(2);
        let dw =
            DataWarehouse::new(Rank(0), Arc::clone(&grid), WarehouseConfig::default()).unwrap();
        let x = VarLabel::cell("X");
        let id = PatchId(patch);
        let mut var = dw.allocate(&x, id, MaterialIndex(material), 0).unwrap();
        var.data_mut().copy_from_slice(&values);
        let expected = var.clone();
        dw.put(var, &x, id, MaterialIndex(material), false).unwrap();
        let got = dw.get(Which::New, &x, id, MaterialIndex(material), 0).unwrap();
        prop_assert!(got.bits_eq(&expected));
    }
}
