//! 资源状态跟踪
//!
//! 记录每个原生资源最近一次被使用时的状态，仅在状态真正变化时产生屏障。
//! 三个后端对屏障的要求不同，由 [`TransitionPolicy`] 区分：
//!
//! - Vulkan 的图像布局必须精确匹配，任何变化都需要屏障
//! - DX12 的只读状态可以合并，已包含目标状态时跳过
//! - Metal 由驱动做冒险跟踪，只更新缓存，从不产生屏障

use std::collections::HashMap;

use bitflags::bitflags;

use super::resource::NativeHandle;

bitflags! {
    /// 资源状态位集
    ///
    /// 空集即 `COMMON`，资源初次出现时处于该状态。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        const COPY_DEST = 1 << 8;
        const COPY_SOURCE = 1 << 9;
        const PRESENT = 1 << 10;

        const SHADER_RESOURCE = Self::NON_PIXEL_SHADER_RESOURCE.bits() | Self::PIXEL_SHADER_RESOURCE.bits();
    }
}

impl ResourceState {
    const WRITE_STATES: ResourceState = ResourceState::RENDER_TARGET
        .union(ResourceState::UNORDERED_ACCESS)
        .union(ResourceState::DEPTH_WRITE)
        .union(ResourceState::COPY_DEST);

    /// 不含任何写状态
    pub fn is_read_only(&self) -> bool {
        !self.intersects(Self::WRITE_STATES)
    }
}

/// 后端的屏障策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPolicy {
    /// 状态不同即产生屏障
    Exact,
    /// 只读状态下，旧状态已包含新状态时跳过
    ReadCombinable,
    /// 只跟踪，不产生屏障
    Implicit,
}

/// 一次状态转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub resource: NativeHandle,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// 资源状态缓存
#[derive(Debug, Clone)]
pub struct ResourceStateCache {
    policy: TransitionPolicy,
    states: HashMap<NativeHandle, ResourceState>,
}

impl ResourceStateCache {
    pub fn new(policy: TransitionPolicy) -> Self {
        Self {
            policy,
            states: HashMap::new(),
        }
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// 请求把资源转换到 `state`
    ///
    /// 需要屏障时返回 `Some`，并把缓存更新为新状态。
    /// 未见过的资源视为处于 `COMMON`，第一次使用必然产生一个屏障
    /// （`Implicit` 策略除外）。
    pub fn transition(&mut self, resource: NativeHandle, state: ResourceState) -> Option<Barrier> {
        let previous = self.states.get(&resource).copied();

        let skip = match (self.policy, previous) {
            (TransitionPolicy::Implicit, _) => true,
            (_, None) => false,
            (TransitionPolicy::Exact, Some(old)) => old == state,
            (TransitionPolicy::ReadCombinable, Some(old)) => {
                old == state || (old.is_read_only() && state.is_read_only() && old.contains(state))
            }
        };

        if skip {
            if self.policy == TransitionPolicy::Implicit {
                self.states.insert(resource, state);
            }
            return None;
        }

        self.states.insert(resource, state);
        Some(Barrier {
            resource,
            before: previous.unwrap_or(ResourceState::COMMON),
            after: state,
        })
    }

    /// 缓存中的当前状态
    pub fn state_of(&self, resource: NativeHandle) -> Option<ResourceState> {
        self.states.get(&resource).copied()
    }

    /// 直接写入状态，不产生屏障
    ///
    /// 用于后端隐式完成的转换（例如渲染通道结束时的布局变换）。
    pub fn set_state(&mut self, resource: NativeHandle, state: ResourceState) {
        self.states.insert(resource, state);
    }

    /// 资源销毁后移除其记录
    pub fn forget(&mut self, resource: NativeHandle) {
        self.states.remove(&resource);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEX: NativeHandle = NativeHandle(42);

    #[test]
    fn test_identical_requests_emit_one_barrier() {
        for policy in [TransitionPolicy::Exact, TransitionPolicy::ReadCombinable] {
            let mut cache = ResourceStateCache::new(policy);
            let first = cache.transition(TEX, ResourceState::RENDER_TARGET);
            assert_eq!(
                first,
                Some(Barrier {
                    resource: TEX,
                    before: ResourceState::COMMON,
                    after: ResourceState::RENDER_TARGET,
                })
            );
            assert!(cache.transition(TEX, ResourceState::RENDER_TARGET).is_none());
        }
    }

    #[test]
    fn test_read_combinable_skips_contained_read_state() {
        let mut cache = ResourceStateCache::new(TransitionPolicy::ReadCombinable);
        cache.transition(TEX, ResourceState::SHADER_RESOURCE);

        // 已处于像素 + 非像素着色器资源状态，只读像素着色器资源不需要屏障
        assert!(cache.transition(TEX, ResourceState::PIXEL_SHADER_RESOURCE).is_none());
        assert_eq!(cache.state_of(TEX), Some(ResourceState::SHADER_RESOURCE));

        // 写状态总是需要屏障
        assert!(cache.transition(TEX, ResourceState::UNORDERED_ACCESS).is_some());
    }

    #[test]
    fn test_exact_policy_does_not_combine() {
        let mut cache = ResourceStateCache::new(TransitionPolicy::Exact);
        cache.transition(TEX, ResourceState::SHADER_RESOURCE);
        let barrier = cache.transition(TEX, ResourceState::PIXEL_SHADER_RESOURCE).unwrap();
        assert_eq!(barrier.before, ResourceState::SHADER_RESOURCE);
        assert_eq!(barrier.after, ResourceState::PIXEL_SHADER_RESOURCE);
    }

    #[test]
    fn test_implicit_policy_tracks_without_barriers() {
        let mut cache = ResourceStateCache::new(TransitionPolicy::Implicit);
        assert!(cache.transition(TEX, ResourceState::COPY_DEST).is_none());
        assert_eq!(cache.state_of(TEX), Some(ResourceState::COPY_DEST));
    }

    #[test]
    fn test_forget_and_clear() {
        let mut cache = ResourceStateCache::new(TransitionPolicy::Exact);
        cache.transition(TEX, ResourceState::COPY_SOURCE);
        cache.transition(NativeHandle(7), ResourceState::COPY_DEST);
        assert_eq!(cache.len(), 2);

        cache.forget(TEX);
        assert_eq!(cache.state_of(TEX), None);
        // 遗忘后重新从 COMMON 开始
        assert_eq!(cache.transition(TEX, ResourceState::COPY_SOURCE).unwrap().before, ResourceState::COMMON);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_read_only_classification() {
        assert!(ResourceState::COMMON.is_read_only());
        assert!(ResourceState::SHADER_RESOURCE.is_read_only());
        assert!((ResourceState::COPY_SOURCE | ResourceState::INDEX_BUFFER).is_read_only());
        assert!(!ResourceState::DEPTH_WRITE.is_read_only());
        assert!(!(ResourceState::COPY_DEST | ResourceState::COPY_SOURCE).is_read_only());
    }
}
