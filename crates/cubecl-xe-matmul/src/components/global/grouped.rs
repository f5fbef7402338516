use crate::components::{
    GemmMode, MatmulAvailabilityError, MatmulProblem, MatrixLayout, Numeric,
    ProblemShape,
    global::{OperandViews, memory::OperandArguments},
};

/// Operands of a grouped GEMM: one problem, one A and one B per group.
///
/// Every group is validated when the arguments are built, so rebinding at a group boundary
/// never fails.
pub struct GroupedOperands<'a, A, B> {
    problems: Vec<ProblemShape>,
    views: Vec<OperandViews<'a, A, B>>,
}

impl<'a, A: Numeric, B: Numeric> GroupedOperands<'a, A, B> {
    pub fn new(
        problems: Vec<ProblemShape>,
        lhs: Vec<OperandArguments<'a, A>>,
        rhs: Vec<OperandArguments<'a, B>>,
        lhs_layout: MatrixLayout,
        rhs_layout: MatrixLayout,
    ) -> Result<Self, MatmulAvailabilityError> {
        let groups = problems.len();
        for got in [lhs.len(), rhs.len()] {
            if got != groups {
                return Err(MatmulAvailabilityError::GroupCountMismatch { groups, got });
            }
        }

        let views = problems
            .iter()
            .zip(lhs)
            .zip(rhs)
            .map(|((shape, lhs), rhs)| {
                let problem = group_problem(*shape, lhs_layout, rhs_layout);
                OperandViews::new(&problem, lhs, rhs)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { problems, views })
    }

    pub fn num_groups(&self) -> usize {
        self.problems.len()
    }

    pub fn problems(&self) -> &[ProblemShape] {
        &self.problems
    }

    /// Problem solved by `group`, as a single GEMM.
    pub fn problem(&self, group: usize) -> MatmulProblem {
        let views = &self.views[group];
        group_problem(
            self.problems[group],
            views.lhs.layout(),
            views.rhs.layout(),
        )
    }

    /// Views over the memory of `group`, with its own shape and strides and `L = 1`.
    pub fn update_tensor_shape_stride(&self, group: usize) -> OperandViews<'a, A, B> {
        self.views[group]
    }
}

/// Single GEMM problem of one group.
pub(crate) fn group_problem(
    shape: ProblemShape,
    lhs_layout: MatrixLayout,
    rhs_layout: MatrixLayout,
) -> MatmulProblem {
    MatmulProblem {
        shape: ProblemShape::new(shape.m, shape.n, shape.k, 1),
        rank: 3,
        mode: GemmMode::Grouped,
        lhs_layout,
        rhs_layout,
    }
}

/// Problem shape spanning every group, used to validate the tile selection once.
pub fn grouped_envelope(problems: &[ProblemShape]) -> ProblemShape {
    problems.iter().fold(ProblemShape::new(0, 0, 0, 1), |acc, shape| {
        ProblemShape::new(
            acc.m.max(shape.m),
            acc.n.max(shape.n),
            acc.k.max(shape.k),
            1,
        )
    })
}
