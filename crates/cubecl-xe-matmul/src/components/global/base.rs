use std::fmt::Debug;
use std::hash::Hash;

use crate::components::{
    FormattedConfigError, LhsG, LhsR, MatmulAvailabilityError, MatmulIdent, MatmulPrecision,
    MatmulProblem, MatmulSetupError, MatrixLayout, Numeric, OperandStream, RhsG, RhsR,
    SubgroupCoord, TileShape, WorkgroupCoord, WorkgroupTiling, AccR,
    global::{
        barrier::SubgroupBarrier,
        copy::CopyPlan,
        listener::{MainloopEvent, MainloopEventListener},
        memory::{OperandArguments, TensorView},
        prefetch::{PrefetchCursor, PrefetchPlan, PrefetchScope, Prefetcher},
    },
    tile::{Fragment, TileMmaConfig, tile_mma},
    tiling::SubgroupArrangement,
};

/// A family of [Mainloop] implementations that operate with any [precision](MatmulPrecision).
pub trait MainloopFamily: Send + Sync + 'static {
    /// The specific [Mainloop] implementation associated with this family.
    type Mainloop<MP: MatmulPrecision>: Mainloop<MP, Config = Self::Config>;

    /// The configuration type associated with this mainloop.
    type Config: MainloopConfig;

    /// Constructs the configuration based on the problem and the selection.
    ///
    /// This function may return an error if the configuration cannot be supported.
    fn setup<MP: MatmulPrecision>(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
    ) -> Result<Self::Config, MatmulSetupError>;
}

/// K reduction of one subgroup tile.
///
/// # Assumptions
/// - Every subgroup of the work-group calls `run` with the same K tile range, since the
///   multi-subgroup variants synchronize on the barrier once per K tile.
/// - The accumulator has the shape of the subgroup tile and is not cleared.
pub trait Mainloop<MP: MatmulPrecision>: 'static + Send + Sync {
    /// The configuration type associated with this mainloop.
    type Config: MainloopConfig;

    fn run<B: SubgroupBarrier, P: Prefetcher, L: MainloopEventListener>(
        views: &OperandViews<'_, LhsG<MP>, RhsG<MP>>,
        acc: &mut Fragment<AccR<MP>>,
        workgroup: &WorkgroupCoord,
        k_tiles: KTileRange,
        subgroup: &mut SubgroupContext<B, P, L>,
        config: Self::Config,
    );
}

/// Configuration shared by every mainloop.
pub trait MainloopConfig:
    Copy + Clone + Eq + PartialEq + Hash + Debug + Send + Sync + 'static
{
    fn tiling(&self) -> WorkgroupTiling;

    /// Number of K tiles prefetched before the first copy.
    fn stages(&self) -> usize;

    fn copy_plan(&self, ident: MatmulIdent) -> CopyPlan;

    fn prefetch_plan(&self, ident: MatmulIdent) -> PrefetchPlan;

    fn tile_mma(&self) -> TileMmaConfig;

    /// Whether subgroups synchronize on the barrier after each K tile.
    fn uses_barrier(&self) -> bool;

    fn subgroup_tile(&self) -> TileShape {
        self.tiling().subgroup_tile()
    }

    /// Description of the resolved plans, logged at the full kernel log level.
    fn describe(&self) -> String;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Tile geometry and pipeline depth chosen for a launch.
pub struct MainloopSelection {
    pub tile: TileShape,
    pub atoms: SubgroupArrangement,
    pub stages: usize,
}

impl MainloopSelection {
    pub fn builder(tile: TileShape, atoms: SubgroupArrangement) -> MainloopSelectionBuilder {
        MainloopSelectionBuilder::new(tile, atoms)
    }
}

pub struct MainloopSelectionBuilder {
    tile: TileShape,
    atoms: SubgroupArrangement,
    stages: Option<usize>,
}

impl MainloopSelectionBuilder {
    fn new(tile: TileShape, atoms: SubgroupArrangement) -> Self {
        Self {
            tile,
            atoms,
            stages: None,
        }
    }

    pub fn stages(mut self, stages: usize) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Unset values are taken from the [global config](crate::config::XeConfig).
    pub fn build(self) -> MainloopSelection {
        MainloopSelection {
            tile: self.tile,
            atoms: self.atoms,
            stages: self
                .stages
                .unwrap_or_else(|| crate::config::XeConfig::get().kernel.stages),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, new)]
/// Contiguous range of K tiles reduced by one mainloop run.
pub struct KTileRange {
    pub start: usize,
    pub count: usize,
}

impl KTileRange {
    /// Every K tile of a problem.
    pub fn full(k_tiles: usize) -> Self {
        Self::new(0, k_tiles)
    }

    pub fn iter(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.count
    }
}

/// Operand views of a launch, bound once to the problem shape.
#[derive(Clone, Copy)]
pub struct OperandViews<'a, A, B> {
    pub lhs: TensorView<'a, A>,
    pub rhs: TensorView<'a, B>,
}

impl<'a, A: Numeric, B: Numeric> OperandViews<'a, A, B> {
    /// Binds caller memory to the shapes and layouts of `problem`.
    pub fn new(
        problem: &MatmulProblem,
        lhs: OperandArguments<'a, A>,
        rhs: OperandArguments<'a, B>,
    ) -> Result<Self, MatmulAvailabilityError> {
        Ok(Self {
            lhs: TensorView::new(
                MatmulIdent::Lhs,
                lhs,
                problem.shape.shape(MatmulIdent::Lhs),
                problem.lhs_layout,
            )?,
            rhs: TensorView::new(
                MatmulIdent::Rhs,
                rhs,
                problem.shape.shape(MatmulIdent::Rhs),
                problem.rhs_layout,
            )?,
        })
    }
}

/// Everything a subgroup owns while it runs: its id, barrier handle, prefetch unit and listener.
pub struct SubgroupContext<B, P, L> {
    id: usize,
    barrier: B,
    prefetcher: P,
    listener: L,
}

impl<B: SubgroupBarrier, P: Prefetcher, L: MainloopEventListener> SubgroupContext<B, P, L> {
    pub fn new(id: usize, barrier: B, prefetcher: P, listener: L) -> Self {
        Self {
            id,
            barrier,
            prefetcher,
            listener,
        }
    }

    /// Linear id of the subgroup in its work-group.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn barrier(&mut self) -> &mut B {
        &mut self.barrier
    }

    pub fn into_parts(self) -> (P, L) {
        (self.prefetcher, self.listener)
    }

    pub fn emit(&mut self, event: MainloopEvent) {
        self.listener.on_event(event);
    }

    pub fn arrive(&mut self, k_tile: usize) {
        self.listener.on_event(MainloopEvent::BarrierArrive { k_tile });
        self.barrier.arrive();
    }

    pub fn wait(&mut self, k_tile: usize) {
        self.listener.on_event(MainloopEvent::BarrierWait { k_tile });
        self.barrier.wait();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn prefetch<E: Numeric>(
        &mut self,
        plan: &PrefetchPlan,
        view: &TensorView<'_, E>,
        workgroup: &WorkgroupCoord,
        coord: &SubgroupCoord,
        stream: OperandStream,
        k_tile: usize,
    ) {
        let region = plan.region(workgroup, coord, k_tile);
        self.listener.on_event(MainloopEvent::Prefetch {
            ident: plan.ident,
            stream,
            k_tile,
        });
        self.prefetcher.prefetch(view, &region);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Plans and geometry resolved at setup, shared by the mainloop variants.
pub struct CommonMainloopConfig {
    pub tiling: WorkgroupTiling,
    pub stages: usize,
    pub lhs_copy: CopyPlan,
    pub rhs_copy: CopyPlan,
    pub lhs_prefetch: PrefetchPlan,
    pub rhs_prefetch: PrefetchPlan,
    pub tile_mma: TileMmaConfig,
    pub barrier: bool,
}

impl CommonMainloopConfig {
    /// Resolves copy and prefetch plans for operands stored as `MP`'s global types.
    pub fn new<MP: MatmulPrecision>(
        problem: &MatmulProblem,
        selection: &MainloopSelection,
        scope: PrefetchScope,
        barrier: bool,
    ) -> Result<Self, MatmulSetupError> {
        let tiling = WorkgroupTiling::new(selection.tile, selection.atoms)?;

        if selection.atoms.k != 1 {
            let atoms = selection.atoms;
            return Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
                move || format!("Subgroup arrangement {atoms} splits K, which no mainloop reduces"),
            )));
        }

        if LhsR::<MP>::BITS != RhsR::<MP>::BITS {
            return Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
                || {
                    format!(
                        "Operands must share a compute width, got {} and {}",
                        LhsR::<MP>::NAME,
                        RhsR::<MP>::NAME
                    )
                },
            )));
        }

        let sg = tiling.subgroup_tile();
        let lhs_layout = problem.layout(MatmulIdent::Lhs);
        let rhs_layout = problem.layout(MatmulIdent::Rhs);

        let (lhs_prefetch, rhs_prefetch) = match scope {
            PrefetchScope::Workgroup => (
                PrefetchPlan::workgroup::<LhsG<MP>>(MatmulIdent::Lhs, lhs_layout, &tiling),
                PrefetchPlan::workgroup::<RhsG<MP>>(MatmulIdent::Rhs, rhs_layout, &tiling),
            ),
            PrefetchScope::Subgroup => {
                if lhs_layout != MatrixLayout::RowMajor || rhs_layout != MatrixLayout::RowMajor {
                    return Err(MatmulSetupError::InvalidConfig(Box::new(
                        "Subgroup scoped prefetch only supports row major operands",
                    )));
                }
                (
                    PrefetchPlan::subgroup::<LhsG<MP>>(MatmulIdent::Lhs, &tiling),
                    PrefetchPlan::subgroup::<RhsG<MP>>(MatmulIdent::Rhs, &tiling),
                )
            }
        };

        Ok(Self {
            tiling,
            stages: selection.stages,
            lhs_copy: CopyPlan::new::<LhsG<MP>>(MatmulIdent::Lhs, lhs_layout, sg.m, sg.k)?,
            rhs_copy: CopyPlan::new::<RhsG<MP>>(MatmulIdent::Rhs, rhs_layout, sg.k, sg.n)?,
            lhs_prefetch,
            rhs_prefetch,
            tile_mma: TileMmaConfig::new::<LhsR<MP>>(sg)?,
            barrier,
        })
    }

    fn plans(&self) -> String {
        format!(
            "tile {} atoms {} subgroup tile {} stages {} | A {} x{} prefetch {} thr {:?} tile {:?} | B {} x{} prefetch {} thr {:?} tile {:?}",
            self.tiling.tile(),
            self.tiling.atoms(),
            self.tiling.subgroup_tile(),
            self.stages,
            self.lhs_copy.transfer,
            self.lhs_copy.instructions(),
            self.lhs_prefetch.transfer,
            self.lhs_prefetch.thread_shape,
            self.lhs_prefetch.tile,
            self.rhs_copy.transfer,
            self.rhs_copy.instructions(),
            self.rhs_prefetch.transfer,
            self.rhs_prefetch.thread_shape,
            self.rhs_prefetch.tile,
        )
    }
}

impl MainloopConfig for CommonMainloopConfig {
    fn tiling(&self) -> WorkgroupTiling {
        self.tiling
    }

    fn stages(&self) -> usize {
        self.stages
    }

    fn copy_plan(&self, ident: MatmulIdent) -> CopyPlan {
        match ident {
            MatmulIdent::Lhs => self.lhs_copy,
            MatmulIdent::Rhs => self.rhs_copy,
            MatmulIdent::Out => unreachable!("The output is written by the epilogue"),
        }
    }

    fn prefetch_plan(&self, ident: MatmulIdent) -> PrefetchPlan {
        match ident {
            MatmulIdent::Lhs => self.lhs_prefetch,
            MatmulIdent::Rhs => self.rhs_prefetch,
            MatmulIdent::Out => unreachable!("The output is never prefetched"),
        }
    }

    fn tile_mma(&self) -> TileMmaConfig {
        self.tile_mma
    }

    fn uses_barrier(&self) -> bool {
        self.barrier
    }

    fn describe(&self) -> String {
        self.plans()
    }
}

/// Fails when the global and register types of an operand differ.
pub(crate) fn check_same_precision<MP: MatmulPrecision>() -> Result<(), MatmulSetupError> {
    use crate::components::same_type;

    if same_type::<LhsG<MP>, LhsR<MP>>() && same_type::<RhsG<MP>, RhsR<MP>>() {
        return Ok(());
    }

    Err(MatmulSetupError::InvalidConfig(FormattedConfigError::new(
        || {
            format!(
                "Operands stored as {}/{} must be computed as such, got {}/{}; use the mixed input mainloop",
                LhsG::<MP>::NAME,
                RhsG::<MP>::NAME,
                LhsR::<MP>::NAME,
                RhsR::<MP>::NAME
            )
        },
    )))
}

/// K loop of the mainloops whose operands are computed in their global type.
///
/// Every K tile loads A then B, prefetches the tile `stages` ahead and accumulates. When the
/// config uses a barrier the tile is enclosed in one split barrier round.
pub(crate) fn run_single_stream<MP, C, Ba, P, L>(
    views: &OperandViews<'_, LhsG<MP>, RhsG<MP>>,
    acc: &mut Fragment<AccR<MP>>,
    workgroup: &WorkgroupCoord,
    k_tiles: KTileRange,
    subgroup: &mut SubgroupContext<Ba, P, L>,
    config: &C,
) where
    MP: MatmulPrecision,
    C: MainloopConfig,
    Ba: SubgroupBarrier,
    P: Prefetcher,
    L: MainloopEventListener,
{
    let tiling = config.tiling();
    let coord = tiling.subgroup_coord(workgroup, subgroup.id());
    let sg = tiling.subgroup_tile();
    let blk_k = tiling.tile().k;
    let barrier = config.uses_barrier();

    let copy_lhs = config.copy_plan(MatmulIdent::Lhs).with(&views.lhs);
    let copy_rhs = config.copy_plan(MatmulIdent::Rhs).with(&views.rhs);
    let mut lhs = Fragment::<LhsG<MP>>::zeros(sg.m, sg.k);
    let mut rhs = Fragment::<RhsG<MP>>::zeros(sg.k, sg.n);

    let mut prefetch = PrefetchCursor::warmup(config.stages(), k_tiles.count, |k| {
        prefetch_operands(views, workgroup, &coord, k_tiles.start + k, subgroup, config)
    });

    for k_tile in k_tiles.iter() {
        if barrier {
            subgroup.arrive(k_tile);
        }

        copy_lhs.copy(coord.m, k_tile * blk_k, coord.l, &mut lhs);
        subgroup.emit(MainloopEvent::Load {
            ident: MatmulIdent::Lhs,
            stream: OperandStream::Primary,
            k_tile,
        });
        copy_rhs.copy(k_tile * blk_k, coord.n, coord.l, &mut rhs);
        subgroup.emit(MainloopEvent::Load {
            ident: MatmulIdent::Rhs,
            stream: OperandStream::Primary,
            k_tile,
        });

        prefetch.advance(|k| {
            prefetch_operands(views, workgroup, &coord, k_tiles.start + k, subgroup, config)
        });

        tile_mma(acc, &lhs, &rhs);
        subgroup.emit(MainloopEvent::Mma {
            stream: OperandStream::Primary,
            k_tile,
        });

        if barrier {
            subgroup.wait(k_tile);
        }
    }
}

/// Prefetches the A then the B tile of `k_tile`.
pub(crate) fn prefetch_operands<C: MainloopConfig, A: Numeric, B: Numeric, Ba, P, L>(
    views: &OperandViews<'_, A, B>,
    workgroup: &WorkgroupCoord,
    coord: &SubgroupCoord,
    k_tile: usize,
    subgroup: &mut SubgroupContext<Ba, P, L>,
    config: &C,
) where
    Ba: SubgroupBarrier,
    P: Prefetcher,
    L: MainloopEventListener,
{
    subgroup.prefetch(
        &config.prefetch_plan(MatmulIdent::Lhs),
        &views.lhs,
        workgroup,
        coord,
        OperandStream::Primary,
        k_tile,
    );
    subgroup.prefetch(
        &config.prefetch_plan(MatmulIdent::Rhs),
        &views.rhs,
        workgroup,
        coord,
        OperandStream::Primary,
        k_tile,
    );
}
